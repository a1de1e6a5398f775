//! Dispatches inbound `command` envelopes to the component that owns the
//! corresponding action. `mount`/`unmount` delegate to the filesystem-mount
//! helper, which spec.md §1 places out of scope as an external collaborator
//! — `MountHelper` models that boundary the same way `VMDriver` models the
//! hypervisor boundary, with a logging no-op standing in for the real thing.

use crate::dispatch::Dispatcher;
use crate::pool::PoolManager;
use crate::task::DispatchRequest;
use crate::ws::envelope::CommandResultPayload;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait MountHelper: Send + Sync {
    async fn mount(&self, agent_id: &str, mount_path: Option<String>) -> anyhow::Result<()>;
    async fn unmount(&self, agent_id: &str) -> anyhow::Result<()>;
}

/// Stands in for the real mount helper (out of scope per spec.md §1); logs
/// the request and reports success so a connected operator UI is not left
/// waiting on a command that will never be implemented in this crate.
pub struct NoopMountHelper;

#[async_trait]
impl MountHelper for NoopMountHelper {
    async fn mount(&self, agent_id: &str, mount_path: Option<String>) -> anyhow::Result<()> {
        info!(agent_id, mount_path = ?mount_path, "mount requested (no-op helper)");
        Ok(())
    }

    async fn unmount(&self, agent_id: &str) -> anyhow::Result<()> {
        info!(agent_id, "unmount requested (no-op helper)");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct KillArgs {
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct MountArgs {
    agent_id: String,
    #[serde(default)]
    mount_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnmountArgs {
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct ShellArgs {
    agent_id: String,
}

pub struct CommandContext {
    pub pool: Arc<PoolManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub mount: Arc<dyn MountHelper>,
}

/// Run one `command` envelope to completion and build its correlated result.
pub async fn run_command(ctx: &CommandContext, id: String, action: &str, args: serde_json::Value) -> CommandResultPayload {
    let result = match action {
        "kill" => run_kill(ctx, args).await,
        "dispatch" => run_dispatch(ctx, args).await,
        "mount" => run_mount(ctx, args).await,
        "unmount" => run_unmount(ctx, args).await,
        "shell" => run_shell(ctx, args).await,
        other => Err(format!("unknown command action '{other}'")),
    };

    match result {
        Ok(message) => CommandResultPayload {
            id,
            success: true,
            message: Some(message),
            error: None,
        },
        Err(error) => CommandResultPayload {
            id,
            success: false,
            message: None,
            error: Some(error),
        },
    }
}

async fn run_kill(ctx: &CommandContext, args: serde_json::Value) -> Result<String, String> {
    let args: KillArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
    ctx.dispatcher
        .kill(&args.agent_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok("killed".to_string())
}

async fn run_dispatch(ctx: &CommandContext, args: serde_json::Value) -> Result<String, String> {
    let req: DispatchRequest = serde_json::from_value(args).map_err(|e| e.to_string())?;
    let result = ctx
        .dispatcher
        .dispatch(req)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_string(&result).map_err(|e| e.to_string())
}

async fn run_mount(ctx: &CommandContext, args: serde_json::Value) -> Result<String, String> {
    let args: MountArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
    ctx.mount
        .mount(&args.agent_id, args.mount_path)
        .await
        .map_err(|e| e.to_string())?;
    Ok("mounted".to_string())
}

async fn run_unmount(ctx: &CommandContext, args: serde_json::Value) -> Result<String, String> {
    let args: UnmountArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
    ctx.mount
        .unmount(&args.agent_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok("unmounted".to_string())
}

async fn run_shell(ctx: &CommandContext, args: serde_json::Value) -> Result<String, String> {
    let args: ShellArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
    let slot = ctx
        .pool
        .get_slot(&args.agent_id)
        .await
        .ok_or_else(|| format!("no slot for agent {}", args.agent_id))?;
    Ok(slot.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::pool::{PoolConfig, PoolStore};
    use crate::registry::{Registry, RegistryStore};
    use crate::vmdriver::MockDriver;

    async fn ctx() -> CommandContext {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new());
        let pool = PoolManager::new(
            PoolConfig {
                warm_size: 1,
                max_vms: 1,
                master_name: "agent-master".into(),
            },
            driver.clone(),
            PoolStore::new(dir.path()),
        )
        .await;
        pool.replenish().await;
        let registry = Arc::new(Registry::new(RegistryStore::new(dir.path())));
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            driver,
            registry,
            AuditLog::new(dir.path()),
        ));
        CommandContext {
            pool,
            dispatcher,
            mount: Arc::new(NoopMountHelper),
        }
    }

    #[tokio::test]
    async fn unknown_action_fails_with_correlated_id() {
        let ctx = ctx().await;
        let result = run_command(&ctx, "req-1".into(), "teleport", serde_json::Value::Null).await;
        assert_eq!(result.id, "req-1");
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn shell_command_returns_vm_name_for_active_slot() {
        let ctx = ctx().await;
        let slot = ctx.pool.claim("agent-1", "proj").await.unwrap();
        let result = run_command(
            &ctx,
            "r1".into(),
            "shell",
            serde_json::json!({"agent_id": "agent-1"}),
        )
        .await;
        assert!(result.success);
        assert_eq!(result.message.unwrap(), slot.name);
    }

    #[tokio::test]
    async fn mount_command_succeeds_via_noop_helper() {
        let ctx = ctx().await;
        let result = run_command(
            &ctx,
            "r2".into(),
            "mount",
            serde_json::json!({"agent_id": "agent-1"}),
        )
        .await;
        assert!(result.success);
    }
}
