//! Refcounted per-agent log-tail subprocesses, fanned out to whichever
//! WebSocket clients are subscribed. See spec.md §4.6.
//!
//! One tailing task per agent exists iff at least one client is subscribed
//! to `logs:<agentID>`; the last `Unsubscribe` tears the task down.

use crate::pool::PoolManager;
use crate::vmdriver::VMDriver;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RUNNER_SERVICE_UNIT: &str = "agentkernel-runner";

/// Sink the log tailer pushes lines into. Implemented by `WSHub`; kept as a
/// trait here so `LogStreamManager` has no compile-time dependency on the WS
/// module, mirroring the Registry/Hub decoupling via `StoreEvent`.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    async fn send_log_line(&self, agent_id: &str, line: String);
}

struct Stream {
    token: CancellationToken,
    subscribers: HashSet<u64>,
}

pub struct LogStreamManager {
    driver: Arc<dyn VMDriver>,
    pool: Arc<PoolManager>,
    streams: Mutex<HashMap<String, Stream>>,
}

impl LogStreamManager {
    pub fn new(driver: Arc<dyn VMDriver>, pool: Arc<PoolManager>) -> Self {
        Self {
            driver,
            pool,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Add `client` as a subscriber to `agentID`'s logs, spawning the tail
    /// subprocess if this is the first subscriber. Fails silently (logs a
    /// debug line) if the agent has no known VM.
    pub async fn subscribe(&self, agent_id: &str, client: u64, sink: Arc<dyn LogSink>) {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get_mut(agent_id) {
            stream.subscribers.insert(client);
            return;
        }

        let Some(slot) = self.pool.get_slot(agent_id).await else {
            debug!(agent_id, "log subscribe: no known VM for agent, ignoring");
            return;
        };

        let token = CancellationToken::new();
        let mut subscribers = HashSet::new();
        subscribers.insert(client);
        streams.insert(
            agent_id.to_string(),
            Stream {
                token: token.clone(),
                subscribers,
            },
        );
        drop(streams);

        let driver = self.driver.clone();
        let agent_id = agent_id.to_string();
        let vm_name = slot.name;
        tokio::spawn(async move {
            tail_loop(driver, vm_name, agent_id, sink, token).await;
        });
    }

    /// Remove `client` from `agentID`'s subscriber set; cancel the tail
    /// subprocess once the set is empty.
    pub async fn unsubscribe(&self, agent_id: &str, client: u64) {
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get_mut(agent_id) else {
            return;
        };
        stream.subscribers.remove(&client);
        if stream.subscribers.is_empty() {
            stream.token.cancel();
            streams.remove(agent_id);
        }
    }

    /// Remove `client` from every stream it is subscribed to. Called on
    /// client disconnect.
    pub async fn unsubscribe_all(&self, client: u64) {
        let mut streams = self.streams.lock().await;
        let mut drained = Vec::new();
        for (agent_id, stream) in streams.iter_mut() {
            stream.subscribers.remove(&client);
            if stream.subscribers.is_empty() {
                stream.token.cancel();
                drained.push(agent_id.clone());
            }
        }
        for agent_id in drained {
            streams.remove(&agent_id);
        }
    }

    /// Cancel every active tail subprocess. Idempotent.
    pub async fn stop_all(&self) {
        let mut streams = self.streams.lock().await;
        for stream in streams.values() {
            stream.token.cancel();
        }
        streams.clear();
    }
}

async fn tail_loop(
    driver: Arc<dyn VMDriver>,
    vm_name: String,
    agent_id: String,
    sink: Arc<dyn LogSink>,
    token: CancellationToken,
) {
    let cmd = "journalctl";
    let args = vec![
        "-u".to_string(),
        RUNNER_SERVICE_UNIT.to_string(),
        "-f".to_string(),
        "--no-pager".to_string(),
    ];

    let mut rx = match driver.shell_stream(&vm_name, cmd, &args, token.clone()).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(agent_id, vm = %vm_name, error = %e, "failed to start log tail stream");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = rx.recv() => {
                match line {
                    Some(line) => sink.send_log_line(&agent_id, line).await,
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, PoolStore};
    use crate::vmdriver::MockDriver;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        lines: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl LogSink for CollectingSink {
        async fn send_log_line(&self, agent_id: &str, line: String) {
            self.lines
                .lock()
                .unwrap()
                .push((agent_id.to_string(), line));
        }
    }

    async fn pool_with_claimed_slot() -> (Arc<PoolManager>, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = PoolStore::new(dir.path());
        let driver = Arc::new(MockDriver::new());
        let manager = PoolManager::new(
            PoolConfig {
                warm_size: 1,
                max_vms: 1,
                master_name: "agent-master".into(),
            },
            driver,
            store,
        )
        .await;
        manager.replenish().await;
        let slot = manager.claim("agent-1", "proj").await.unwrap();
        (manager, slot.name)
    }

    #[tokio::test]
    async fn subscribe_with_unknown_agent_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = PoolStore::new(dir.path());
        let driver: Arc<dyn VMDriver> = Arc::new(MockDriver::new());
        let manager = PoolManager::new(
            PoolConfig {
                warm_size: 0,
                max_vms: 0,
                master_name: "m".into(),
            },
            driver.clone(),
            store,
        )
        .await;
        let manager = LogStreamManager::new(driver, manager);
        let sink: Arc<dyn LogSink> = Arc::new(CollectingSink {
            lines: StdMutex::new(Vec::new()),
        });
        manager.subscribe("ghost", 1, sink).await;
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn unsubscribe_all_is_idempotent() {
        let (pool, _name) = pool_with_claimed_slot().await;
        let driver: Arc<dyn VMDriver> = Arc::new(MockDriver::new());
        let manager = LogStreamManager::new(driver, pool);
        manager.unsubscribe_all(42).await;
        manager.unsubscribe_all(42).await;
    }

    #[tokio::test]
    async fn subscribe_streams_seeded_lines_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let store = PoolStore::new(dir.path());
        let mock = Arc::new(MockDriver::new());
        let driver: Arc<dyn VMDriver> = mock.clone();
        let pool = PoolManager::new(
            PoolConfig {
                warm_size: 1,
                max_vms: 1,
                master_name: "agent-master".into(),
            },
            driver.clone(),
            store,
        )
        .await;
        pool.replenish().await;
        let slot = pool.claim("agent-1", "proj").await.unwrap();
        mock.set_tail_lines(&slot.name, vec!["line one".into(), "line two".into()]);

        let manager = LogStreamManager::new(driver, pool);
        let sink = Arc::new(CollectingSink {
            lines: StdMutex::new(Vec::new()),
        });
        manager
            .subscribe("agent-1", 1, sink.clone() as Arc<dyn LogSink>)
            .await;

        let mut seen = 0;
        for _ in 0..100 {
            if sink.lines.lock().unwrap().len() >= 2 {
                seen = sink.lines.lock().unwrap().len();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(seen >= 2, "expected at least 2 tailed lines, got {seen}");

        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines[0], ("agent-1".to_string(), "line one".to_string()));
        assert_eq!(lines[1], ("agent-1".to_string(), "line two".to_string()));
        drop(lines);

        manager.unsubscribe("agent-1", 1).await;
    }
}
