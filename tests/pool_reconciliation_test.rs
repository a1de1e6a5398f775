//! Startup reconciliation and the periodic liveness sweep working together
//! across a restart boundary, the scenario spec.md §8 calls out explicitly:
//! a dangling pool record for a VM that no longer exists must never survive
//! a daemon restart, and an active slot whose VM vanishes mid-run must be
//! reclaimed without operator intervention.

use agentkernel_fleetd::monitor::Monitor;
use agentkernel_fleetd::pool::{PoolConfig, PoolManager, PoolStore};
use agentkernel_fleetd::vmdriver::MockDriver;
use std::sync::Arc;

fn config() -> PoolConfig {
    PoolConfig {
        warm_size: 2,
        max_vms: 2,
        master_name: "agent-master".into(),
    }
}

#[tokio::test]
async fn restart_prunes_slots_whose_vm_was_deleted_out_of_band() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MockDriver::new());

    let first_boot = PoolManager::new(config(), driver.clone(), PoolStore::new(dir.path())).await;
    first_boot.replenish().await;
    let slots_before = first_boot.list_slots().await;
    assert_eq!(slots_before.len(), 2);

    // one warm VM disappears at the hypervisor without fleetd knowing
    driver.remove_out_of_band(&slots_before[0].name);

    let second_boot = PoolManager::new(config(), driver.clone(), PoolStore::new(dir.path())).await;
    let slots_after = second_boot.list_slots().await;
    assert_eq!(slots_after.len(), 1);
    assert_eq!(slots_after[0].name, slots_before[1].name);
}

#[tokio::test]
async fn monitor_sweep_reclaims_active_slot_after_vm_disappears_mid_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MockDriver::new());
    let pool = PoolManager::new(config(), driver.clone(), PoolStore::new(dir.path())).await;
    pool.replenish().await;

    let slot = pool.claim("agent-1", "proj").await.unwrap();
    assert!(slot.is_active());

    driver.remove_out_of_band(&slot.name);

    let monitor = Monitor::new(pool.clone(), driver);
    monitor.sweep().await;

    let reloaded = pool.get_slot_by_name(&slot.name).await.unwrap();
    assert!(!reloaded.is_active());
    assert!(reloaded.agent_id.is_none());
}
