//! The agent registry: an in-memory map of live dispatches plus the
//! event bus that keeps observers (chiefly `WSHub`) in sync. See
//! spec.md §4.4.

mod store;

pub use store::RegistryStore;

use crate::error::{FleetError, FleetResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Domain state string published by the in-VM runner via `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Cloning,
    Executing,
    Pushing,
    Serving,
    Completed,
    Failed,
    Killed,
    Registered,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Failed | AgentState::Killed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub vm_name: String,
    pub vm_ip: String,
    pub project: String,
    pub tool: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub state: AgentState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreEvent {
    Registered {
        agent_id: String,
        agent: AgentRegistration,
    },
    Deregistered {
        agent_id: String,
    },
    Updated {
        agent_id: String,
        agent: AgentRegistration,
    },
}

impl StoreEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            StoreEvent::Registered { agent_id, .. }
            | StoreEvent::Deregistered { agent_id }
            | StoreEvent::Updated { agent_id, .. } => agent_id,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StoreEvent>,
}

/// In-memory `agentID -> AgentRegistration` map with durable snapshot and
/// non-blocking event fan-out. Reads/writes of the map are serialized by an
/// `RwLock`; subscriber management has its own mutex so a slow subscriber
/// list scan never blocks a registration mutation.
pub struct Registry {
    agents: RwLock<HashMap<String, AgentRegistration>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber_id: Mutex<u64>,
    store: RegistryStore,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<StoreEvent>,
}

impl Registry {
    pub fn new(store: RegistryStore) -> Self {
        let snapshot = store.load();
        Registry {
            agents: RwLock::new(snapshot),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: Mutex::new(0),
            store,
        }
    }

    pub async fn register(
        &self,
        agent_id: &str,
        vm_name: &str,
        vm_ip: &str,
        project: &str,
        tool: &str,
        ports: Vec<u16>,
    ) -> AgentRegistration {
        let now = Utc::now();
        let agent = AgentRegistration {
            agent_id: agent_id.to_string(),
            vm_name: vm_name.to_string(),
            vm_ip: vm_ip.to_string(),
            project: project.to_string(),
            tool: tool.to_string(),
            branch: None,
            state: AgentState::Registered,
            message: None,
            ports,
            registered_at: now,
            last_heartbeat: now,
        };

        {
            let mut agents = self.agents.write().await;
            agents.insert(agent_id.to_string(), agent.clone());
            self.persist(&agents);
        }

        self.emit(StoreEvent::Registered {
            agent_id: agent_id.to_string(),
            agent: agent.clone(),
        })
        .await;
        agent
    }

    pub async fn deregister(&self, agent_id: &str) -> FleetResult<()> {
        {
            let mut agents = self.agents.write().await;
            if agents.remove(agent_id).is_none() {
                return Err(FleetError::NotFound(agent_id.to_string()));
            }
            self.persist(&agents);
        }
        self.emit(StoreEvent::Deregistered {
            agent_id: agent_id.to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn update_state(
        &self,
        agent_id: &str,
        state: AgentState,
        message: Option<String>,
        branch: Option<String>,
    ) -> FleetResult<AgentRegistration> {
        let agent = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| FleetError::NotFound(agent_id.to_string()))?;
            agent.state = state;
            agent.last_heartbeat = Utc::now();
            if message.is_some() {
                agent.message = message;
            }
            if branch.is_some() {
                agent.branch = branch;
            }
            let agent = agent.clone();
            self.persist(&agents);
            agent
        };

        self.emit(StoreEvent::Updated {
            agent_id: agent_id.to_string(),
            agent: agent.clone(),
        })
        .await;
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn agents(&self) -> Vec<AgentRegistration> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Register a subscriber for `StoreEvent`s. The returned queue has
    /// capacity 64; a subscriber that falls behind silently misses events and
    /// must resynchronize via the periodic status snapshot.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = {
            let mut next = self.next_subscriber_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.subscribers.lock().unwrap().push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    fn persist(&self, agents: &HashMap<String, AgentRegistration>) {
        self.store.save(agents);
    }

    async fn emit(&self, event: StoreEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = sub.id, "registry event dropped, subscriber queue full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RegistryStore {
        let dir = tempfile::tempdir().unwrap();
        RegistryStore::new(dir.path())
    }

    #[tokio::test]
    async fn register_then_deregister_leaves_no_entry_and_emits_two_events() {
        let registry = Registry::new(store());
        let mut sub = registry.subscribe().await;

        registry.register("a1", "warm-1", "10.0.0.2", "proj", "claude-code", vec![]).await;
        registry.deregister("a1").await.unwrap();

        assert!(registry.get("a1").await.is_none());
        let ev1 = sub.rx.try_recv().unwrap();
        let ev2 = sub.rx.try_recv().unwrap();
        assert!(matches!(ev1, StoreEvent::Registered { .. }));
        assert!(matches!(ev2, StoreEvent::Deregistered { .. }));
    }

    #[tokio::test]
    async fn register_preserves_reported_ports() {
        let registry = Registry::new(store());
        let agent = registry
            .register("a1", "warm-1", "10.0.0.2", "proj", "claude-code", vec![3000, 3001])
            .await;
        assert_eq!(agent.ports, vec![3000, 3001]);
        assert_eq!(registry.get("a1").await.unwrap().ports, vec![3000, 3001]);
    }

    #[tokio::test]
    async fn update_state_on_unknown_agent_returns_not_found() {
        let registry = Registry::new(store());
        let err = registry
            .update_state("ghost", AgentState::Executing, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn mutate_then_reload_from_disk_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store1 = RegistryStore::new(dir.path());
        let registry = Registry::new(store1);
        registry.register("a1", "warm-1", "10.0.0.2", "proj", "amp", vec![]).await;

        let store2 = RegistryStore::new(dir.path());
        let reloaded = Registry::new(store2);
        let agent = reloaded.get("a1").await.unwrap();
        assert_eq!(agent.vm_name, "warm-1");
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_events_without_blocking_or_erroring() {
        let registry = Registry::new(store());
        let mut sub = registry.subscribe().await;
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            registry
                .register(&format!("a{i}"), "warm-1", "10.0.0.2", "proj", "cline", vec![])
                .await;
        }
        let mut drained = 0;
        while sub.rx.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= SUBSCRIBER_QUEUE_CAPACITY);
    }
}
