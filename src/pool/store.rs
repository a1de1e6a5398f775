//! Durable JSON snapshot of the slot table.
//!
//! Same full-file-rewrite contract as the rest of the control plane's
//! persisted documents (spec.md §4.2): `save` always writes the complete
//! document, `load` returns an empty snapshot on first boot. A torn write on
//! crash is tolerated because `PoolManager::reconcile` repairs against the
//! hypervisor's own listing on the next start.

use super::Slot;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub slots: Vec<Slot>,
    pub counter: u64,
}

pub struct PoolStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PoolStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            path: base_dir.as_ref().join("pool-state.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> PoolSnapshot {
        let _guard = self.lock.lock().unwrap();
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, path = %self.path.display(), "pool snapshot corrupt, starting empty");
                PoolSnapshot::default()
            }),
            Err(_) => PoolSnapshot::default(),
        }
    }

    pub fn save(&self, snapshot: &PoolSnapshot) {
        let _guard = self.lock.lock().unwrap();
        let json = match serde_json::to_string_pretty(snapshot) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize pool snapshot");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create pool base dir");
                return;
            }
        }
        if let Err(e) = std::fs::write(&self.path, json) {
            warn!(error = %e, path = %self.path.display(), "failed to persist pool snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SlotState;
    use chrono::Utc;

    #[test]
    fn load_missing_file_returns_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = PoolStore::new(dir.path());
        let snapshot = store.load();
        assert!(snapshot.slots.is_empty());
        assert_eq!(snapshot.counter, 0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PoolStore::new(dir.path());
        let snapshot = PoolSnapshot {
            slots: vec![Slot {
                name: "warm-1".into(),
                state: SlotState::Idle,
                agent_id: None,
                project: None,
                tool: None,
                branch: None,
                issue: None,
                vm_ip: Some("10.0.0.5".into()),
                created_at: Utc::now(),
                claimed_at: None,
            }],
            counter: 1,
        };
        store.save(&snapshot);
        let loaded = store.load();
        assert_eq!(loaded.counter, 1);
        assert_eq!(loaded.slots.len(), 1);
        assert_eq!(loaded.slots[0].name, "warm-1");
    }
}
