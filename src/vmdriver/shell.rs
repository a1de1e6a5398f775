//! Production `VMDriver` that shells out to a hypervisor control CLI.
//!
//! Mirrors the teacher's `find_firecracker()` binary-discovery convention
//! (`FIRECRACKER_BIN` env var → local install dir → common paths → `$PATH`)
//! generalized to a configurable, vendor-neutral `<driver> <subcommand>
//! <args...>` CLI so this crate never hardcodes a specific hypervisor.

use super::{CopyDirection, VMDriver, VmInfo, VmState};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const STREAM_CHANNEL_CAPACITY: usize = 256;

const DRIVER_BIN_ENV: &str = "FLEETD_VM_DRIVER_BIN";

/// Shells out to an external hypervisor CLI binary to implement `VMDriver`.
pub struct ShellVMDriver {
    bin: PathBuf,
}

impl ShellVMDriver {
    pub fn new() -> Result<Self> {
        Ok(Self {
            bin: find_driver_bin()?,
        })
    }

    pub fn with_binary(bin: PathBuf) -> Self {
        Self { bin }
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let fut = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(timeout, fut)
            .await
            .with_context(|| format!("timed out after {:?} running {:?}", timeout, args))?
            .with_context(|| format!("failed to spawn driver for {:?}", args))?;

        if !output.status.success() {
            bail!(
                "driver command {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn find_driver_bin() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(DRIVER_BIN_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Some(home) = std::env::var_os("HOME") {
        let local = PathBuf::from(home).join(".local/share/agentkernel/bin/vm-driver");
        if local.exists() {
            return Ok(local);
        }
    }

    for loc in ["/usr/local/bin/vm-driver", "/usr/bin/vm-driver"] {
        let path = PathBuf::from(loc);
        if path.exists() {
            return Ok(path);
        }
    }

    bail!(
        "VM driver binary not found; set {} or install vm-driver on PATH",
        DRIVER_BIN_ENV
    )
}

#[async_trait]
impl VMDriver for ShellVMDriver {
    async fn clone_vm(
        &self,
        master: &str,
        name: &str,
        start: bool,
        timeout: Duration,
    ) -> Result<()> {
        let start_flag = if start { "--start" } else { "--no-start" };
        self.run(&["clone", master, name, start_flag], timeout)
            .await?;
        Ok(())
    }

    async fn start(&self, name: &str, timeout: Duration) -> Result<()> {
        self.run(&["start", name], timeout).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        self.run(&["stop", name], timeout).await?;
        Ok(())
    }

    async fn delete(&self, name: &str, force: bool, timeout: Duration) -> Result<()> {
        if force {
            self.run(&["delete", name, "--force"], timeout).await?;
        } else {
            self.run(&["delete", name], timeout).await?;
        }
        Ok(())
    }

    async fn list(&self, timeout: Duration) -> Result<Vec<VmInfo>> {
        let stdout = self.run(&["list", "--format", "json"], timeout).await?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<RawVmInfo> =
            serde_json::from_str(&stdout).context("failed to parse vm-driver list output")?;
        Ok(raw.into_iter().map(RawVmInfo::into_vm_info).collect())
    }

    async fn get(&self, name: &str, timeout: Duration) -> Result<Option<VmInfo>> {
        let all = self.list(timeout).await?;
        Ok(all.into_iter().find(|vm| vm.name == name))
    }

    async fn shell(
        &self,
        name: &str,
        cmd: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String> {
        let mut full_args: Vec<&str> = vec!["shell", name, cmd];
        full_args.extend(args.iter().map(String::as_str));
        self.run(&full_args, timeout).await
    }

    async fn shell_stream(
        &self,
        name: &str,
        cmd: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>> {
        let mut full_args: Vec<String> = vec!["shell".to_string(), name.to_string(), cmd.to_string()];
        full_args.extend(args.iter().cloned());

        let mut child = Command::new(&self.bin)
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn driver for {:?}", full_args))?;

        let stdout = child
            .stdout
            .take()
            .context("driver child process has no piped stdout")?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let vm_name = name.to_string();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => {
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(vm = %vm_name, error = %e, "log tail stream read error");
                            break;
                        }
                    },
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        });

        Ok(rx)
    }

    async fn copy(
        &self,
        name: &str,
        direction: CopyDirection,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<()> {
        let local_str = local.to_string_lossy();
        let args = match direction {
            CopyDirection::ToVm => vec!["copy", "--to-vm", name, local_str.as_ref(), remote],
            CopyDirection::FromVm => vec!["copy", "--from-vm", name, remote, local_str.as_ref()],
        };
        self.run(&args, timeout).await?;
        Ok(())
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawVmInfo {
    name: String,
    running: bool,
}

impl RawVmInfo {
    fn into_vm_info(self) -> VmInfo {
        VmInfo {
            name: self.name,
            state: if self.running {
                VmState::Running
            } else {
                VmState::Stopped
            },
        }
    }
}
