//! Protocol trigger: owns the connection to the provisioning service and
//! sends one malformed request per invocation.
//!
//! The connection is established once and reused; the service side does
//! expensive per-client initialisation on first contact, so reconnecting
//! per request would crater the trigger rate.

pub mod batch;
pub mod source;

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, warn};
use thiserror::Error;

use protocol::{
    decode_reply, encode_request, ProvisioningReply, ProvisioningRequest, RequestKind,
    WireConstants,
};

#[derive(Debug, Error)]
pub enum TriggerError {
    /// Lookup/connect failure. Fatal: nothing works without the service.
    #[error("provisioning service unavailable at {path}: {source}")]
    ServiceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn trigger binary {path}: {source}")]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// External trigger exited or closed stdout before its readiness line.
    #[error("trigger binary did not report readiness")]
    TriggerNotReady,
}

/// Outcome of one trigger invocation. Everything here is retryable; only
/// the initial connect is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Request went out. The reply is best-effort: `None` when it was
    /// malformed or deliberately not read (the race needs only the side
    /// effect inside the service).
    Success { reply: Option<ProvisioningReply> },
    SendFailed,
    ReceiveTimeout,
}

pub struct ServiceClient {
    stream: UnixStream,
}

impl ServiceClient {
    pub fn connect(socket: &Path) -> Result<Self, TriggerError> {
        let stream =
            UnixStream::connect(socket).map_err(|source| TriggerError::ServiceUnavailable {
                path: socket.to_path_buf(),
                source,
            })?;
        Ok(Self { stream })
    }

    /// Bound the blocking reply read. `None` keeps the transport default.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Send one request and wait for its reply. Used by batch mode, where
    /// nothing else is racing the clock.
    pub fn send_once(
        &mut self,
        subject: &str,
        kind: RequestKind,
        capacity: u32,
    ) -> TriggerOutcome {
        let frame = match self.build_frame(subject, kind, capacity) {
            Some(frame) => frame,
            None => return TriggerOutcome::SendFailed,
        };
        if let Err(e) = self.stream.write_all(&frame) {
            debug!("[Trigger] send failed: {e}");
            return TriggerOutcome::SendFailed;
        }
        match self.read_reply() {
            Ok(reply) => {
                if let Some(reply) = &reply {
                    if reply.truncation_confirmed() {
                        debug!(
                            "[Trigger] truncation confirmed: {}",
                            reply.path.as_deref().unwrap_or_default()
                        );
                    }
                }
                TriggerOutcome::Success { reply }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                TriggerOutcome::ReceiveTimeout
            }
            Err(e) => {
                debug!("[Trigger] receive failed: {e}");
                TriggerOutcome::SendFailed
            }
        }
    }

    /// Send one request without waiting for the reply. The race loop uses
    /// this so the detection wait starts while the service is still inside
    /// its create-then-own sequence; stale replies are drained on the next
    /// call.
    pub fn fire_and_forget(
        &mut self,
        subject: &str,
        kind: RequestKind,
        capacity: u32,
    ) -> TriggerOutcome {
        self.drain_pending();
        let frame = match self.build_frame(subject, kind, capacity) {
            Some(frame) => frame,
            None => return TriggerOutcome::SendFailed,
        };
        match self.stream.write_all(&frame) {
            Ok(()) => TriggerOutcome::Success { reply: None },
            Err(e) => {
                debug!("[Trigger] send failed: {e}");
                TriggerOutcome::SendFailed
            }
        }
    }

    fn build_frame(&self, subject: &str, kind: RequestKind, capacity: u32) -> Option<Vec<u8>> {
        match encode_request(&ProvisioningRequest::new(subject, kind, capacity)) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!("[Trigger] encode failed: {e}");
                None
            }
        }
    }

    fn read_reply(&mut self) -> io::Result<Option<ProvisioningReply>> {
        let mut head = [0u8; 8];
        self.stream.read_exact(&mut head)?;
        let declared = u32::from_le_bytes(head[4..8].try_into().expect("fixed slice")) as usize;
        if declared < WireConstants::REPLY_HEADER_LEN {
            // A size word smaller than the fixed header means the framing
            // itself is untrustworthy.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "reply declares an impossible size",
            ));
        }
        let total = declared.min(WireConstants::MAX_REPLY_LEN);
        let mut frame = vec![0u8; total];
        frame[..8].copy_from_slice(&head);
        self.stream.read_exact(&mut frame[8..])?;
        // Consume anything beyond what we buffer, or the next framed read
        // starts mid-message.
        let mut excess = declared - total;
        let mut sink = [0u8; 256];
        while excess > 0 {
            let take = excess.min(sink.len());
            self.stream.read_exact(&mut sink[..take])?;
            excess -= take;
        }
        match decode_reply(&frame) {
            Ok(reply) => Ok(Some(reply)),
            Err(e) => {
                // Non-fatal: the race depends on the service's side effect,
                // not on a parseable reply.
                warn!("[Trigger] malformed reply: {e}");
                Ok(None)
            }
        }
    }

    fn drain_pending(&mut self) {
        if self.stream.set_nonblocking(true).is_err() {
            return;
        }
        let mut sink = [0u8; 1024];
        loop {
            match self.stream.read(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = self.stream.set_nonblocking(false);
    }
}
