//! The warm-pool slot model and its owning components: `PoolStore` (durable
//! snapshot) and `PoolManager` (state machine + background replenish).

mod manager;
mod store;

pub use manager::PoolManager;
pub use store::{PoolSnapshot, PoolStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for the pool's target size and identity of the golden master.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub warm_size: usize,
    pub max_vms: usize,
    pub master_name: String,
}

/// Lifecycle state of a pool slot. See spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Creating,
    Idle,
    Active,
    Cold,
}

/// A single warm-pool unit: a cloned VM and its current role.
///
/// Invariant: `agent_id.is_some() <=> state == Active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    pub state: SlotState,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub vm_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn new_creating(name: String) -> Self {
        Self {
            name,
            state: SlotState::Creating,
            agent_id: None,
            project: None,
            tool: None,
            branch: None,
            issue: None,
            vm_ip: None,
            created_at: Utc::now(),
            claimed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SlotState::Active
    }
}

/// Aggregate counts for `PoolManager::status`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    pub warm: usize,
    pub active: usize,
    pub cold: usize,
}
