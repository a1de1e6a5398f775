//! `PoolManager` — the slot state machine, warm-pool replenishment, and
//! hypervisor reconciliation. See spec.md §4.3.

use super::{PoolConfig, PoolStatus, Slot, SlotState};
use crate::error::{FleetError, FleetResult};
use crate::pool::store::{PoolSnapshot, PoolStore};
use crate::vmdriver::VMDriver;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

const CLONE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const IP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REPLENISH_INTERVAL: Duration = Duration::from_secs(30);

struct PoolState {
    slots: Vec<Slot>,
    counter: u64,
}

pub struct PoolManager {
    state: Mutex<PoolState>,
    config: StdRwLock<PoolConfig>,
    driver: Arc<dyn VMDriver>,
    store: PoolStore,
    shutdown: AtomicBool,
    self_ref: Weak<PoolManager>,
}

impl PoolManager {
    /// Construct the manager, loading any persisted snapshot and reconciling
    /// it against the hypervisor's own listing before returning (spec.md
    /// §8 scenario 6: orphaned records from a dead VM are pruned on boot).
    pub async fn new(
        config: PoolConfig,
        driver: Arc<dyn VMDriver>,
        store: PoolStore,
    ) -> Arc<Self> {
        let snapshot = store.load();
        let live_names: HashSet<String> = driver
            .list(Duration::from_secs(10))
            .await
            .map(|vms| vms.into_iter().map(|vm| vm.name).collect())
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to list hypervisor VMs during reconciliation; keeping snapshot as-is");
                snapshot.slots.iter().map(|s| s.name.clone()).collect()
            });

        let before = snapshot.slots.len();
        let slots: Vec<Slot> = snapshot
            .slots
            .into_iter()
            .filter(|s| live_names.contains(&s.name))
            .collect();
        if slots.len() != before {
            info!(
                dropped = before - slots.len(),
                "reconciled pool snapshot against hypervisor listing"
            );
        }

        let manager = Arc::new_cyclic(|weak| PoolManager {
            state: Mutex::new(PoolState {
                slots,
                counter: snapshot.counter,
            }),
            config: StdRwLock::new(config),
            driver,
            store,
            shutdown: AtomicBool::new(false),
            self_ref: weak.clone(),
        });
        manager.persist_locked_unconditionally().await;
        manager
    }

    async fn persist_locked_unconditionally(&self) {
        let state = self.state.lock().await;
        self.persist(&state);
    }

    fn persist(&self, state: &PoolState) {
        self.store.save(&PoolSnapshot {
            slots: state.slots.clone(),
            counter: state.counter,
        });
    }

    /// Claim the first available Idle slot for `agent_id`/`project`.
    ///
    /// Never blocks: returns `FleetError::Capacity` immediately if no Idle
    /// slot exists. The VM-IP probe happens *outside* the slot-table lock
    /// (spec.md §9 open question, resolved — see DESIGN.md) so a slow probe
    /// never serializes other claims behind it.
    pub async fn claim(&self, agent_id: &str, project: &str) -> FleetResult<Slot> {
        let name = {
            let mut state = self.state.lock().await;
            let idx = state
                .slots
                .iter()
                .position(|s| s.state == SlotState::Idle)
                .ok_or(FleetError::Capacity)?;

            let slot = &mut state.slots[idx];
            slot.state = SlotState::Active;
            slot.agent_id = Some(agent_id.to_string());
            slot.project = Some(project.to_string());
            slot.claimed_at = Some(Utc::now());
            let name = slot.name.clone();
            self.persist(&state);
            name
        };

        if let Ok(ip) = self
            .driver
            .shell(&name, "hostname", &["-I".to_string()], IP_PROBE_TIMEOUT)
            .await
        {
            let ip = ip.trim().split_whitespace().next().map(str::to_string);
            if ip.is_some() {
                let mut state = self.state.lock().await;
                if let Some(slot) = state.slots.iter_mut().find(|s| s.name == name) {
                    slot.vm_ip = ip;
                }
                self.persist(&state);
            }
        }

        if let Some(arc_self) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                arc_self.replenish().await;
            });
        }

        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or(FleetError::Capacity)
    }

    /// Attach task metadata (tool/branch/issue) dispatched into an already-claimed slot.
    pub async fn set_task_info(
        &self,
        name: &str,
        tool: Option<String>,
        branch: Option<String>,
        issue: Option<String>,
    ) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        let slot = state
            .slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;
        slot.tool = tool;
        slot.branch = branch;
        slot.issue = issue;
        self.persist(&state);
        Ok(())
    }

    /// Release a claimed slot back to Cold. Idempotent when already non-Active.
    pub async fn release(&self, name: &str) -> FleetResult<()> {
        let mut state = self.state.lock().await;
        let slot = state
            .slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;

        if slot.state == SlotState::Active {
            slot.state = SlotState::Cold;
            slot.agent_id = None;
            slot.project = None;
        }
        self.persist(&state);
        Ok(())
    }

    /// Remove a slot's record, then best-effort delete the underlying VM.
    ///
    /// Record removal happens first on purpose: a crash between the two
    /// steps leaves a dangling VM (detectable at the next reconcile) rather
    /// than a dangling record that claims could pick up again.
    pub async fn destroy(&self, name: &str) -> FleetResult<()> {
        {
            let mut state = self.state.lock().await;
            let before = state.slots.len();
            state.slots.retain(|s| s.name != name);
            if state.slots.len() == before {
                return Err(FleetError::NotFound(name.to_string()));
            }
            self.persist(&state);
        }

        if let Err(e) = self.driver.delete(name, true, Duration::from_secs(30)).await {
            warn!(slot = name, error = %e, "failed to delete VM after removing pool record");
        }
        Ok(())
    }

    /// Destroy every currently Idle slot.
    pub async fn drain(&self) {
        let idle: Vec<String> = {
            let state = self.state.lock().await;
            state
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Idle)
                .map(|s| s.name.clone())
                .collect()
        };
        for name in idle {
            let _ = self.destroy(&name).await;
        }
    }

    pub fn resize(&self, warm_size: usize) {
        self.config.write().unwrap().warm_size = warm_size;
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let mut status = PoolStatus::default();
        for slot in &state.slots {
            match slot.state {
                SlotState::Idle => status.warm += 1,
                SlotState::Active => status.active += 1,
                SlotState::Cold => status.cold += 1,
                SlotState::Creating => {}
            }
        }
        status
    }

    pub async fn active_slots(&self) -> Vec<Slot> {
        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Active)
            .cloned()
            .collect()
    }

    pub async fn list_slots(&self) -> Vec<Slot> {
        self.state.lock().await.slots.clone()
    }

    pub async fn get_slot(&self, agent_id: &str) -> Option<Slot> {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .find(|s| s.agent_id.as_deref() == Some(agent_id))
            .cloned()
    }

    pub async fn get_slot_by_name(&self, name: &str) -> Option<Slot> {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    /// Reserve one `Creating` slot if `warm_size`/`max_vms` allow it. Returns
    /// the reserved name, or `None` if the pool is already at target/cap.
    /// Re-validated under the lock on every call so concurrent `replenish`
    /// invocations can never overshoot `max_vms` (spec.md §8 invariant).
    async fn try_reserve_slot(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let warm_size = self.config.read().unwrap().warm_size;
        let max_vms = self.config.read().unwrap().max_vms;

        let idle_count = state.slots.iter().filter(|s| s.state == SlotState::Idle).count();
        if idle_count >= warm_size || state.slots.len() >= max_vms {
            return None;
        }

        state.counter += 1;
        let name = format!("warm-{}", state.counter);
        state.slots.push(Slot::new_creating(name.clone()));
        self.persist(&state);
        Some(name)
    }

    async fn mark_idle(&self, name: &str) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.iter_mut().find(|s| s.name == name) {
            slot.state = SlotState::Idle;
        }
        self.persist(&state);
    }

    async fn drop_reservation(&self, name: &str) {
        let mut state = self.state.lock().await;
        state.slots.retain(|s| s.name != name);
        self.persist(&state);
    }

    /// Top up the warm pool toward `warm_size`, never exceeding `max_vms`.
    pub async fn replenish(&self) {
        let master_name = self.config.read().unwrap().master_name.clone();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let Some(name) = self.try_reserve_slot().await else {
                return;
            };

            match self
                .driver
                .clone_vm(&master_name, &name, true, CLONE_TIMEOUT)
                .await
            {
                Ok(()) => {
                    self.mark_idle(&name).await;
                    info!(slot = %name, "warm slot ready");
                }
                Err(e) => {
                    warn!(slot = %name, error = %e, "failed to clone warm VM");
                    self.drop_reservation(&name).await;
                }
            }
        }
    }

    /// Drop any slot whose name no longer exists at the hypervisor. The sole
    /// authority for pruning orphaned records (spec.md §4.3).
    pub async fn reconcile(&self) {
        let live: HashSet<String> = match self.driver.list(Duration::from_secs(10)).await {
            Ok(vms) => vms.into_iter().map(|vm| vm.name).collect(),
            Err(e) => {
                warn!(error = %e, "reconcile: failed to list hypervisor VMs");
                return;
            }
        };
        let mut state = self.state.lock().await;
        let before = state.slots.len();
        state.slots.retain(|s| live.contains(&s.name));
        if state.slots.len() != before {
            info!(dropped = before - state.slots.len(), "reconcile pruned orphaned slots");
        }
        self.persist(&state);
    }

    /// Run `replenish` once immediately, then every 30s until `shutdown()`.
    pub async fn run_replenish_loop(&self) {
        self.replenish().await;
        while !self.shutdown.load(Ordering::SeqCst) {
            sleep(REPLENISH_INTERVAL).await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.replenish().await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
