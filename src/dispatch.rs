//! The dispatch pipeline: validate a task, atomically claim a warm slot,
//! materialize its config into the VM, restart the in-VM runner, and
//! guarantee slot release on any failure along the way. See spec.md §4.8.

use crate::audit::{AuditEvent, AuditLog};
use crate::error::{FleetError, FleetResult};
use crate::pool::PoolManager;
use crate::registry::Registry;
use crate::task::{DispatchRequest, TaskConfig};
use crate::vmdriver::{CopyDirection, VMDriver};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const OUTER_DEADLINE: Duration = Duration::from_secs(2 * 60);
const COPY_TIMEOUT: Duration = Duration::from_secs(60);
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
const RUNNER_SERVICE_UNIT: &str = "agentkernel-runner";

/// The reverse-proxy route table is an external collaborator (spec.md §1,
/// out of scope); `ProxyRouteHelper` models that boundary the same way
/// `VMDriver` models the hypervisor boundary, with a logging no-op standing
/// in for the real thing.
#[async_trait]
pub trait ProxyRouteHelper: Send + Sync {
    async fn remove_route(&self, agent_id: &str) -> anyhow::Result<()>;
}

/// Stands in for the real reverse-proxy route table; logs the request and
/// reports success so `kill` isn't blocked on a collaborator this crate
/// doesn't implement.
pub struct NoopProxyRouteHelper;

#[async_trait]
impl ProxyRouteHelper for NoopProxyRouteHelper {
    async fn remove_route(&self, agent_id: &str) -> anyhow::Result<()> {
        info!(agent_id, "proxy route removal requested (no-op helper)");
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchResult {
    pub agent_id: String,
    pub vm_name: String,
    pub vm_ip: Option<String>,
}

pub struct Dispatcher {
    pool: Arc<PoolManager>,
    driver: Arc<dyn VMDriver>,
    registry: Arc<Registry>,
    audit: AuditLog,
    proxy: Arc<dyn ProxyRouteHelper>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<PoolManager>,
        driver: Arc<dyn VMDriver>,
        registry: Arc<Registry>,
        audit: AuditLog,
    ) -> Self {
        Self::with_proxy(pool, driver, registry, audit, Arc::new(NoopProxyRouteHelper))
    }

    pub fn with_proxy(
        pool: Arc<PoolManager>,
        driver: Arc<dyn VMDriver>,
        registry: Arc<Registry>,
        audit: AuditLog,
        proxy: Arc<dyn ProxyRouteHelper>,
    ) -> Self {
        Self {
            pool,
            driver,
            registry,
            audit,
            proxy,
        }
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> FleetResult<DispatchResult> {
        match tokio::time::timeout(OUTER_DEADLINE, self.dispatch_inner(req)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::external(
                "dispatch exceeded 2-minute deadline",
                anyhow::anyhow!("timed out"),
            )),
        }
    }

    async fn dispatch_inner(&self, req: DispatchRequest) -> FleetResult<DispatchResult> {
        let agent_id = generate_agent_id();
        let project = req.project.clone();

        let config = match TaskConfig::build(agent_id.clone(), req, "127.0.0.1".to_string(), Utc::now()) {
            Ok(c) => c,
            Err(e) => {
                self.record_failure(&project, "validate", &e.to_string());
                return Err(e);
            }
        };

        let slot = match self.pool.claim(&agent_id, &config.project).await {
            Ok(s) => s,
            Err(e) => {
                self.record_failure(&project, "claim", &e.to_string());
                return Err(e);
            }
        };

        let _ = self
            .pool
            .set_task_info(
                &slot.name,
                Some(config.tool.as_str().to_string()),
                Some(config.branch.clone()),
                config.issue.clone(),
            )
            .await;

        if let Err(e) = self.inject_task_config(&slot.name, &config).await {
            self.rollback(&slot.name, &project, "inject_config", &e).await;
            return Err(e);
        }

        if let Err(e) = self.inject_env_file(&slot.name, &config).await {
            self.rollback(&slot.name, &project, "inject_env", &e).await;
            return Err(e);
        }

        if let Err(e) = self.restart_runner(&slot.name).await {
            self.rollback(&slot.name, &project, "restart_runner", &e).await;
            return Err(e);
        }

        info!(agent_id = %agent_id, vm = %slot.name, "dispatch succeeded");
        self.record_success(&agent_id, &project, &slot.name);

        Ok(DispatchResult {
            agent_id,
            vm_name: slot.name,
            vm_ip: slot.vm_ip,
        })
    }

    async fn inject_task_config(&self, vm_name: &str, config: &TaskConfig) -> FleetResult<()> {
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| FleetError::external("serializing task config", e.into()))?;
        let tmp = write_temp_file(&json)
            .map_err(|e| FleetError::external("writing temp task config", e))?;

        self.driver
            .copy(
                vm_name,
                CopyDirection::ToVm,
                tmp.path(),
                "/etc/agent-config/task.json",
                COPY_TIMEOUT,
            )
            .await
            .map_err(|e| FleetError::external("injecting task config", e))
    }

    async fn inject_env_file(&self, vm_name: &str, config: &TaskConfig) -> FleetResult<()> {
        let mut contents = String::new();
        for (key, value) in &config.env_vars {
            contents.push_str(&format!("{key}={value}\n"));
        }
        let tmp = write_temp_file(contents.as_bytes())
            .map_err(|e| FleetError::external("writing temp env file", e))?;

        self.driver
            .copy(
                vm_name,
                CopyDirection::ToVm,
                tmp.path(),
                "/etc/agent-config/env",
                COPY_TIMEOUT,
            )
            .await
            .map_err(|e| FleetError::external("injecting env file", e))
    }

    async fn restart_runner(&self, vm_name: &str) -> FleetResult<()> {
        self.driver
            .shell(
                vm_name,
                "systemctl",
                &["restart".to_string(), RUNNER_SERVICE_UNIT.to_string()],
                RESTART_TIMEOUT,
            )
            .await
            .map(|_| ())
            .map_err(|e| FleetError::external("restarting runner service", e))
    }

    async fn rollback(&self, slot_name: &str, project: &str, stage: &str, err: &FleetError) {
        warn!(slot = slot_name, stage, error = %err, "dispatch failed, releasing slot");
        if let Err(release_err) = self.pool.release(slot_name).await {
            warn!(slot = slot_name, error = %release_err, "failed to release slot during rollback");
        }
        self.record_failure(project, stage, &err.to_string());
    }

    fn record_success(&self, agent_id: &str, project: &str, vm_name: &str) {
        let _ = self.audit.record(AuditEvent::DispatchSucceeded {
            agent_id: agent_id.to_string(),
            project: project.to_string(),
            vm_name: vm_name.to_string(),
        });
    }

    fn record_failure(&self, project: &str, stage: &str, error: &str) {
        let _ = self.audit.record(AuditEvent::DispatchFailed {
            project: project.to_string(),
            stage: stage.to_string(),
            error: error.to_string(),
        });
    }

    /// Used by the `kill` WS command: release the slot, drop its proxy route,
    /// and deregister the agent (spec.md §4.7).
    pub async fn kill(&self, agent_id: &str) -> FleetResult<()> {
        if let Some(slot) = self.pool.get_slot(agent_id).await {
            self.pool.release(&slot.name).await?;
        }
        if let Err(e) = self.proxy.remove_route(agent_id).await {
            warn!(agent_id, error = %e, "failed to remove proxy route during kill");
        }
        let _ = self.registry.deregister(agent_id).await;
        Ok(())
    }
}

/// `agent-<lowBits(now)>` per spec §4.8 step 1: low 32 bits of the current
/// Unix-epoch nanosecond count, hex-encoded.
fn generate_agent_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let low_bits = now.as_nanos() as u32;
    format!("agent-{low_bits:x}")
}

fn write_temp_file(contents: &[u8]) -> anyhow::Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new()?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, PoolStore};
    use crate::registry::RegistryStore;
    use crate::vmdriver::MockDriver;

    async fn build(driver: Arc<MockDriver>) -> (Arc<PoolManager>, Arc<Registry>, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let pool_store = PoolStore::new(dir.path());
        let pool = PoolManager::new(
            PoolConfig {
                warm_size: 1,
                max_vms: 2,
                master_name: "agent-master".into(),
            },
            driver.clone(),
            pool_store,
        )
        .await;
        pool.replenish().await;

        let registry = Arc::new(Registry::new(RegistryStore::new(dir.path())));
        let audit = AuditLog::new(dir.path());
        let dispatcher = Dispatcher::new(pool.clone(), driver, registry.clone(), audit);
        (pool, registry, dispatcher)
    }

    fn req() -> DispatchRequest {
        DispatchRequest {
            project: "proj".into(),
            repo_url: "https://example.com/repo.git".into(),
            tool: "claude-code".into(),
            prompt: "do the thing".into(),
            branch: None,
            issue: None,
            max_time: None,
            env_vars: Default::default(),
        }
    }

    struct RecordingProxyRouteHelper {
        removed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProxyRouteHelper for RecordingProxyRouteHelper {
        async fn remove_route(&self, agent_id: &str) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(agent_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn kill_removes_proxy_route_and_deregisters() {
        let driver = Arc::new(MockDriver::new());
        let (pool, registry, dispatcher) = build(driver).await;
        let proxy = Arc::new(RecordingProxyRouteHelper {
            removed: std::sync::Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::with_proxy(
            pool.clone(),
            dispatcher.driver.clone(),
            registry.clone(),
            AuditLog::new(tempfile::tempdir().unwrap().path()),
            proxy.clone(),
        );

        let result = dispatcher.dispatch(req()).await.unwrap();
        registry
            .register(&result.agent_id, &result.vm_name, "10.0.0.2", "proj", "claude-code", vec![])
            .await;

        dispatcher.kill(&result.agent_id).await.unwrap();

        assert_eq!(proxy.removed.lock().unwrap().as_slice(), [result.agent_id.clone()]);
        assert!(registry.get(&result.agent_id).await.is_none());
    }

    #[tokio::test]
    async fn successful_dispatch_claims_and_restarts_runner() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _registry, dispatcher) = build(driver).await;
        let result = dispatcher.dispatch(req()).await.unwrap();
        let slot = pool.get_slot(&result.agent_id).await.unwrap();
        assert!(slot.is_active());
    }

    #[tokio::test]
    async fn shell_failure_rolls_back_to_cold_not_active() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _registry, dispatcher) = build(driver.clone()).await;
        driver.set_fail_shell(true);

        let err = dispatcher.dispatch(req()).await.unwrap_err();
        assert_eq!(err.kind(), "external");

        let slots = pool.list_slots().await;
        assert!(slots.iter().all(|s| !s.is_active()));
        assert!(slots.iter().any(|s| matches!(s.state, crate::pool::SlotState::Cold)));
    }

    #[tokio::test]
    async fn validation_failure_touches_no_slot() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _registry, dispatcher) = build(driver).await;
        let mut bad = req();
        bad.project = String::new();

        let err = dispatcher.dispatch(bad).await.unwrap_err();
        assert_eq!(err.kind(), "validation");

        let status = pool.status().await;
        assert_eq!(status.active, 0);
        assert_eq!(status.warm, 1);
    }

    #[tokio::test]
    async fn capacity_failure_when_pool_empty() {
        let driver = Arc::new(MockDriver::new());
        let dir = tempfile::tempdir().unwrap();
        let pool_store = PoolStore::new(dir.path());
        let pool = PoolManager::new(
            PoolConfig {
                warm_size: 0,
                max_vms: 0,
                master_name: "agent-master".into(),
            },
            driver.clone(),
            pool_store,
        )
        .await;
        let registry = Arc::new(Registry::new(RegistryStore::new(dir.path())));
        let audit = AuditLog::new(dir.path());
        let dispatcher = Dispatcher::new(pool, driver, registry, audit);

        let err = dispatcher.dispatch(req()).await.unwrap_err();
        assert_eq!(err.kind(), "capacity");
    }
}
