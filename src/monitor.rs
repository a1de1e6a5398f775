//! Periodic liveness sweep: the sole recovery path when a VM crashes
//! without its runner deregistering. See spec.md §4.9.

use crate::pool::PoolManager;
use crate::vmdriver::{VMDriver, VmState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const GET_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Monitor {
    pool: Arc<PoolManager>,
    driver: Arc<dyn VMDriver>,
}

impl Monitor {
    pub fn new(pool: Arc<PoolManager>, driver: Arc<dyn VMDriver>) -> Self {
        Self { pool, driver }
    }

    /// Run one sweep of `ActiveSlots()`, releasing any slot whose VM has
    /// vanished or stopped running.
    pub async fn sweep(&self) {
        for slot in self.pool.active_slots().await {
            let reclaim = match self.driver.get(&slot.name, GET_TIMEOUT).await {
                Ok(Some(info)) => info.state != VmState::Running,
                Ok(None) => true,
                Err(e) => {
                    warn!(slot = %slot.name, error = %e, "monitor: failed to query VM state, skipping");
                    false
                }
            };

            if reclaim {
                info!(slot = %slot.name, agent_id = ?slot.agent_id, "monitor reclaiming slot with vanished VM");
                if let Err(e) = self.pool.release(&slot.name).await {
                    warn!(slot = %slot.name, error = %e, "monitor: failed to release slot");
                }
            }
        }
    }

    /// Run `sweep` every 15 seconds until cancelled.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}
