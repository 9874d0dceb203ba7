//! Pluggable trigger source for the race coordinator: either an in-process
//! client on the shared connection, or an external trigger binary running
//! in batch mode (one process, many calls; its per-process setup runs once).

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use log::{debug, info};

use protocol::RequestKind;

use crate::trigger::{batch, ServiceClient, TriggerError, TriggerOutcome};

pub trait TriggerSource {
    /// Fire (or account for) one trigger. Must not block longer than the
    /// caller's detection budget.
    fn fire(&mut self) -> TriggerOutcome;
}

pub struct InProcessTrigger {
    client: ServiceClient,
    subject: String,
    kind: RequestKind,
    capacity: u32,
}

impl InProcessTrigger {
    pub fn new(client: ServiceClient, subject: &str, kind: RequestKind, capacity: u32) -> Self {
        Self {
            client,
            subject: subject.to_owned(),
            kind,
            capacity,
        }
    }
}

impl TriggerSource for InProcessTrigger {
    fn fire(&mut self) -> TriggerOutcome {
        self.client
            .fire_and_forget(&self.subject, self.kind, self.capacity)
    }
}

/// A spawned trigger binary looping on its own. `fire` only checks the
/// child is still alive; the calls themselves arrive asynchronously.
pub struct ExternalTrigger {
    child: Child,
    // Held so the pipe stays open; the child's summary line lands here.
    _stdout: BufReader<ChildStdout>,
}

impl ExternalTrigger {
    pub fn spawn(
        bin: &Path,
        socket: &Path,
        subject: &str,
        kind: RequestKind,
        capacity: u32,
        count: u64,
        delay_us: u64,
    ) -> Result<Self, TriggerError> {
        let kind_flag = match kind {
            RequestKind::Container => "container",
            RequestKind::Cache => "cache",
        };
        let mut child = Command::new(bin)
            .arg("trigger")
            .args(["--subject", subject])
            .arg("--socket")
            .arg(socket)
            .args(["--kind", kind_flag])
            .args(["--capacity", &capacity.to_string()])
            .args(["--count", &count.to_string()])
            .args(["--delay-us", &delay_us.to_string()])
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| TriggerError::SpawnFailed {
                path: bin.to_path_buf(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(TriggerError::TriggerNotReady)?;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TriggerError::TriggerNotReady);
                }
                Ok(_) => {
                    if line.trim_end() == batch::READY_MARKER {
                        info!("[Trigger] external trigger ready (pid {})", child.id());
                        break;
                    }
                }
            }
        }

        Ok(Self {
            child,
            _stdout: reader,
        })
    }
}

impl TriggerSource for ExternalTrigger {
    fn fire(&mut self) -> TriggerOutcome {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("[Trigger] external trigger exited: {status}");
                TriggerOutcome::SendFailed
            }
            _ => TriggerOutcome::Success { reply: None },
        }
    }
}

impl Drop for ExternalTrigger {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
