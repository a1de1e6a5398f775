//! `VMDriver` — the abstract hypervisor capability.
//!
//! This is the one seam in the control plane where real polymorphism is
//! needed (spec.md §9, "Dynamic polymorphism"): one production-shaped
//! implementation that shells out to a hypervisor CLI, and one in-memory
//! test double. The trait treats every operation as a trusted synchronous
//! boundary bounded by a caller-supplied deadline; failures surface as
//! `anyhow::Error` with the operation's stderr preserved, which callers
//! wrap into `FleetError::External` with operation context.

pub mod mock;
pub mod shell;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use mock::MockDriver;
pub use shell::ShellVMDriver;

/// Observed run state of a VM as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Running,
    Stopped,
}

/// A VM as listed/described by the hypervisor, independent of pool bookkeeping.
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
}

/// Direction of a `VMDriver::copy` transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    ToVm,
    FromVm,
}

/// Abstract hypervisor operations. See spec §4.1.
#[async_trait]
pub trait VMDriver: Send + Sync {
    /// Clone `master` into a freshly named VM, optionally starting it.
    async fn clone_vm(&self, master: &str, name: &str, start: bool, timeout: Duration)
    -> Result<()>;

    async fn start(&self, name: &str, timeout: Duration) -> Result<()>;

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Delete a VM. `force` skips a graceful stop first.
    async fn delete(&self, name: &str, force: bool, timeout: Duration) -> Result<()>;

    /// List every VM the hypervisor currently knows about.
    async fn list(&self, timeout: Duration) -> Result<Vec<VmInfo>>;

    /// Describe a single VM, or `None` if it does not exist.
    async fn get(&self, name: &str, timeout: Duration) -> Result<Option<VmInfo>>;

    /// Run a command inside `name` and return its stdout once it exits.
    async fn shell(
        &self,
        name: &str,
        cmd: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String>;

    /// Run a long-lived command inside `name` and stream its stdout lines as
    /// they're produced, rather than buffering until the process exits. Used
    /// for live log tailing (`journalctl -u <service> -f`), where `shell`'s
    /// buffer-until-exit contract would never surface output from a command
    /// that blocks until cancelled. `cancel` governs the command's lifetime:
    /// firing it terminates the underlying process and closes the channel.
    async fn shell_stream(
        &self,
        name: &str,
        cmd: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>>;

    /// Copy a file into (`ToVm`) or out of (`FromVm`) a VM.
    async fn copy(
        &self,
        name: &str,
        direction: CopyDirection,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<()>;
}
