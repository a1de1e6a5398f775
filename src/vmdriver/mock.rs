//! In-memory `VMDriver` test double.
//!
//! State lives entirely in a `Mutex<HashMap>`; failures are injected via
//! explicit toggles rather than timing games, so tests driving §8's
//! boundary scenarios (dispatch rollback on shell failure, reconciliation
//! after an out-of-band delete) are deterministic.

use super::{CopyDirection, VMDriver, VmInfo, VmState};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Fault {
    fail_clone: bool,
    fail_shell: bool,
    fail_copy: bool,
}

pub struct MockDriver {
    vms: Mutex<HashMap<String, VmState>>,
    fault: Mutex<Fault>,
    tail_lines: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            vms: Mutex::new(HashMap::new()),
            fault: Mutex::new(Fault::default()),
            tail_lines: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the lines `shell_stream` emits for `name`, simulating a log tail
    /// subprocess that produces output over time.
    pub fn set_tail_lines(&self, name: &str, lines: Vec<String>) {
        self.tail_lines.lock().unwrap().insert(name.to_string(), lines);
    }

    /// Seed a VM as already existing (used to set up reconciliation fixtures).
    pub fn seed(&self, name: &str, state: VmState) {
        self.vms.lock().unwrap().insert(name.to_string(), state);
    }

    /// Remove a VM out-of-band, simulating an operator deleting it at the hypervisor.
    pub fn remove_out_of_band(&self, name: &str) {
        self.vms.lock().unwrap().remove(name);
    }

    pub fn set_fail_clone(&self, fail: bool) {
        self.fault.lock().unwrap().fail_clone = fail;
    }

    pub fn set_fail_shell(&self, fail: bool) {
        self.fault.lock().unwrap().fail_shell = fail;
    }

    pub fn set_fail_copy(&self, fail: bool) {
        self.fault.lock().unwrap().fail_copy = fail;
    }
}

#[async_trait]
impl VMDriver for MockDriver {
    async fn clone_vm(
        &self,
        _master: &str,
        name: &str,
        start: bool,
        _timeout: Duration,
    ) -> Result<()> {
        if self.fault.lock().unwrap().fail_clone {
            bail!("mock: clone failed");
        }
        let state = if start {
            VmState::Running
        } else {
            VmState::Stopped
        };
        self.vms.lock().unwrap().insert(name.to_string(), state);
        Ok(())
    }

    async fn start(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        match vms.get_mut(name) {
            Some(state) => {
                *state = VmState::Running;
                Ok(())
            }
            None => bail!("mock: no such vm {name}"),
        }
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        match vms.get_mut(name) {
            Some(state) => {
                *state = VmState::Stopped;
                Ok(())
            }
            None => bail!("mock: no such vm {name}"),
        }
    }

    async fn delete(&self, name: &str, _force: bool, _timeout: Duration) -> Result<()> {
        self.vms.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list(&self, _timeout: Duration) -> Result<Vec<VmInfo>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .iter()
            .map(|(name, state)| VmInfo {
                name: name.clone(),
                state: *state,
            })
            .collect())
    }

    async fn get(&self, name: &str, _timeout: Duration) -> Result<Option<VmInfo>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .get(name)
            .map(|state| VmInfo {
                name: name.to_string(),
                state: *state,
            }))
    }

    async fn shell(
        &self,
        name: &str,
        _cmd: &str,
        _args: &[String],
        _timeout: Duration,
    ) -> Result<String> {
        if self.fault.lock().unwrap().fail_shell {
            bail!("mock: shell failed");
        }
        if !self.vms.lock().unwrap().contains_key(name) {
            bail!("mock: no such vm {name}");
        }
        Ok(String::new())
    }

    async fn shell_stream(
        &self,
        name: &str,
        _cmd: &str,
        _args: &[String],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>> {
        if self.fault.lock().unwrap().fail_shell {
            bail!("mock: shell failed");
        }
        if !self.vms.lock().unwrap().contains_key(name) {
            bail!("mock: no such vm {name}");
        }

        let lines = self
            .tail_lines
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            for line in lines {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = tx.send(line) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
            // mirrors a real tail subprocess that keeps running until cancelled
            cancel.cancelled().await;
        });

        Ok(rx)
    }

    async fn copy(
        &self,
        name: &str,
        _direction: CopyDirection,
        _local: &Path,
        _remote: &str,
        _timeout: Duration,
    ) -> Result<()> {
        if self.fault.lock().unwrap().fail_copy {
            bail!("mock: copy failed");
        }
        if !self.vms.lock().unwrap().contains_key(name) {
            bail!("mock: no such vm {name}");
        }
        Ok(())
    }
}
