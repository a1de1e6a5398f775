//! `WSHub` — the single owner of the operator WebSocket client set.
//!
//! Mutations of the client set are serialized through one mutex, matching
//! the teacher's style of modeling a "single owning task" as a mutex-guarded
//! shared struct reached only through its own methods (see `PoolManager`,
//! `Registry`). Broadcasts are non-blocking per-client enqueues; a full
//! queue drops that client's message and nothing else (spec.md §4.7).

use crate::logstream::LogSink;
use crate::pool::PoolManager;
use crate::registry::{Registry, StoreEvent};
use crate::ws::envelope::{
    AgentDeregisteredPayload, AgentRegisteredPayload, Envelope, LogsDataPayload,
    StatusSnapshotPayload, StatusUpdatePayload,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use tracing::debug;

const CLIENT_QUEUE_CAPACITY: usize = 256;
const SNAPSHOT_TICK: Duration = Duration::from_secs(5);
const STATUS_CHANNEL: &str = "status";

struct ClientState {
    tx: mpsc::Sender<String>,
    subscriptions: Mutex<HashSet<String>>,
}

pub struct WSHub {
    pool: Arc<PoolManager>,
    registry: Arc<Registry>,
    clients: Mutex<HashMap<u64, Arc<ClientState>>>,
    next_client_id: AtomicU64,
}

impl WSHub {
    pub fn new(pool: Arc<PoolManager>, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
        })
    }

    pub async fn register(self: &Arc<Self>) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let state = Arc::new(ClientState {
            tx,
            subscriptions: Mutex::new(HashSet::new()),
        });
        self.clients.lock().await.insert(id, state);
        (id, rx)
    }

    pub async fn unregister(&self, client_id: u64) {
        self.clients.lock().await.remove(&client_id);
    }

    pub async fn subscribe(&self, client_id: u64, channel: &str) {
        let clients = self.clients.lock().await;
        let Some(state) = clients.get(&client_id) else {
            return;
        };
        state.subscriptions.lock().await.insert(channel.to_string());
        if channel == STATUS_CHANNEL {
            let snapshot = self.build_status_snapshot().await;
            self.enqueue(state, snapshot).await;
        }
    }

    pub async fn unsubscribe(&self, client_id: u64, channel: &str) {
        let clients = self.clients.lock().await;
        if let Some(state) = clients.get(&client_id) {
            state.subscriptions.lock().await.remove(channel);
        }
    }

    /// Send an envelope directly to one client, bypassing channel
    /// subscriptions. Used for `command.result` correlation responses.
    pub async fn reply_to(&self, client_id: u64, envelope: Envelope) {
        let clients = self.clients.lock().await;
        if let Some(state) = clients.get(&client_id) {
            self.enqueue(state, envelope).await;
        }
    }

    async fn build_status_snapshot(&self) -> Envelope {
        let pool = self.pool.status().await;
        let agents = self.registry.agents().await;
        Envelope::new("status.snapshot", StatusSnapshotPayload { pool, agents })
    }

    async fn enqueue(&self, state: &Arc<ClientState>, envelope: Envelope) {
        if state.tx.try_send(envelope.to_line()).is_err() {
            debug!("client send queue full, dropping message");
        }
    }

    /// Non-blocking fan-out to every client subscribed to `channel`.
    async fn broadcast(&self, channel: &str, envelope: Envelope) {
        let clients = self.clients.lock().await;
        let line = envelope.to_line();
        for state in clients.values() {
            if state.subscriptions.lock().await.contains(channel) {
                if state.tx.try_send(line.clone()).is_err() {
                    debug!(channel, "client send queue full, dropping message");
                }
            }
        }
    }

    /// Emit a `status.update`/`agent.registered`/`agent.deregistered` for a
    /// Registry `StoreEvent`, broadcast to every `status` subscriber.
    pub async fn handle_registry_event(&self, event: StoreEvent) {
        let envelope = match event {
            StoreEvent::Registered { agent_id, agent } => {
                Envelope::new("agent.registered", AgentRegisteredPayload { agent_id, agent })
            }
            StoreEvent::Deregistered { agent_id } => {
                Envelope::new("agent.deregistered", AgentDeregisteredPayload { agent_id })
            }
            StoreEvent::Updated { agent_id, agent } => Envelope::new(
                "status.update",
                StatusUpdatePayload {
                    agent_id,
                    state: agent.state,
                    message: agent.message,
                    branch: agent.branch,
                },
            ),
        };
        self.broadcast(STATUS_CHANNEL, envelope).await;
    }

    /// Background task: forward every Registry event to `status` subscribers.
    pub async fn run_registry_forwarder(self: Arc<Self>) {
        let mut sub = self.registry.subscribe().await;
        while let Some(event) = sub.rx.recv().await {
            self.handle_registry_event(event).await;
        }
    }

    /// Background task: push a fresh `status.snapshot` to every `status`
    /// subscriber every 5 seconds, the catch-up path for dropped incrementals.
    pub async fn run_snapshot_ticker(self: Arc<Self>) {
        let mut ticker = interval(SNAPSHOT_TICK);
        loop {
            ticker.tick().await;
            let snapshot = self.build_status_snapshot().await;
            self.broadcast(STATUS_CHANNEL, snapshot).await;
        }
    }
}

#[async_trait]
impl LogSink for WSHub {
    async fn send_log_line(&self, agent_id: &str, line: String) {
        let channel = format!("logs:{agent_id}");
        let envelope = Envelope::new(
            "logs.data",
            LogsDataPayload {
                agent_id: agent_id.to_string(),
                line,
            },
        );
        self.broadcast(&channel, envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, PoolStore};
    use crate::registry::RegistryStore;
    use crate::vmdriver::MockDriver;

    async fn hub() -> Arc<WSHub> {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new());
        let pool = PoolManager::new(
            PoolConfig {
                warm_size: 0,
                max_vms: 0,
                master_name: "m".into(),
            },
            driver,
            PoolStore::new(dir.path()),
        )
        .await;
        let registry = Arc::new(Registry::new(RegistryStore::new(dir.path())));
        WSHub::new(pool, registry)
    }

    #[tokio::test]
    async fn subscribe_to_status_enqueues_immediate_snapshot() {
        let hub = hub().await;
        let (id, mut rx) = hub.register().await;
        hub.subscribe(id, "status").await;
        let line = rx.try_recv().unwrap();
        assert!(line.contains("status.snapshot"));
    }

    #[tokio::test]
    async fn broadcast_skips_clients_not_subscribed_to_channel() {
        let hub = hub().await;
        let (id, mut rx) = hub.register().await;
        // not subscribed to logs:agent-1
        hub.send_log_line("agent-1", "hello".to_string()).await;
        assert!(rx.try_recv().is_err());
        let _ = id;
    }

    #[tokio::test]
    async fn full_queue_drops_message_for_that_client_only() {
        let hub = hub().await;
        let (id, _rx) = hub.register().await;
        hub.subscribe(id, "status").await;
        // fill the queue well past capacity; none of this should panic or block.
        for _ in 0..(CLIENT_QUEUE_CAPACITY + 5) {
            hub.broadcast(STATUS_CHANNEL, Envelope::new("status.update", serde_json::json!({})))
                .await;
        }
    }
}
