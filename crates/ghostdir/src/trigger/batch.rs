//! Standalone batch mode: one long-lived process hammering the service
//! while a separate coordinator watches the filesystem. The stdout lines
//! here are a process-to-process contract; the coordinator parses them
//! as plain-text markers, so they bypass the log crate on purpose.

use std::thread;
use std::time::Duration;

use log::info;

use protocol::RequestKind;

use crate::signals;
use crate::trigger::{ServiceClient, TriggerOutcome};

/// Printed once the one-time setup (the connect) has completed.
pub const READY_MARKER: &str = "TRIGGER READY";
/// Prefix of the final summary line.
pub const DONE_PREFIX: &str = "TRIGGER DONE";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: u64,
    pub ok: u64,
    pub failed: u64,
}

impl BatchReport {
    /// At least one call went through. A batch where every send failed
    /// means the service was never really reachable.
    pub fn succeeded(&self) -> bool {
        self.ok > 0
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{DONE_PREFIX} sent={} ok={} failed={}",
            self.sent, self.ok, self.failed
        )
    }
}

pub fn run(
    client: &mut ServiceClient,
    subject: &str,
    kind: RequestKind,
    capacity: u32,
    count: u64,
    delay: Duration,
) -> BatchReport {
    println!("{READY_MARKER}");
    info!("[Trigger] batch started: count={count} delay={delay:?}");

    let mut report = BatchReport::default();
    for _ in 0..count {
        if signals::cancelled() {
            info!("[Trigger] batch interrupted after {} calls", report.sent);
            break;
        }
        report.sent += 1;
        match client.send_once(subject, kind, capacity) {
            TriggerOutcome::Success { .. } => report.ok += 1,
            TriggerOutcome::SendFailed | TriggerOutcome::ReceiveTimeout => report.failed += 1,
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    println!("{}", report.summary_line());
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_is_parseable() {
        let report = BatchReport {
            sent: 10,
            ok: 7,
            failed: 3,
        };
        assert_eq!(report.summary_line(), "TRIGGER DONE sent=10 ok=7 failed=3");
        assert!(report.summary_line().starts_with(DONE_PREFIX));
    }

    #[test]
    fn all_failed_batch_is_a_failure() {
        let report = BatchReport {
            sent: 10,
            ok: 0,
            failed: 10,
        };
        assert!(!report.succeeded());
        assert!(BatchReport {
            sent: 1,
            ok: 1,
            failed: 0
        }
        .succeeded());
    }
}
