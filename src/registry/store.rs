//! Durable JSON snapshot of the agent registry. Same full-file-rewrite
//! contract as `PoolStore` (spec.md §4.2, §8 shared-resource policy).

use super::AgentRegistration;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct RegistryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RegistryStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            path: base_dir.as_ref().join("registry.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> HashMap<String, AgentRegistration> {
        let _guard = self.lock.lock().unwrap();
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, path = %self.path.display(), "registry snapshot corrupt, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    pub fn save(&self, agents: &HashMap<String, AgentRegistration>) {
        let _guard = self.lock.lock().unwrap();
        let json = match serde_json::to_string_pretty(agents) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize registry snapshot");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create registry base dir");
                return;
            }
        }
        if let Err(e) = std::fs::write(&self.path, json) {
            warn!(error = %e, path = %self.path.display(), "failed to persist registry snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentState;
    use chrono::Utc;

    #[test]
    fn load_missing_file_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        assert!(store.load().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path());
        let mut agents = HashMap::new();
        agents.insert(
            "a1".to_string(),
            AgentRegistration {
                agent_id: "a1".into(),
                vm_name: "warm-1".into(),
                vm_ip: "10.0.0.2".into(),
                project: "proj".into(),
                tool: "claude-code".into(),
                branch: None,
                state: AgentState::Registered,
                message: None,
                ports: vec![],
                registered_at: Utc::now(),
                last_heartbeat: Utc::now(),
            },
        );
        store.save(&agents);
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["a1"].vm_name, "warm-1");
    }
}
