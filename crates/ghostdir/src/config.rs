use std::path::PathBuf;

pub const DEFAULT_TARGET: &str = "/etc/hosts";
pub const DEFAULT_SOCKET: &str = "/var/run/dirprovd.sock";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: u64 = 5000;

/// Post-swap busy-wait, in spin iterations. Best-effort heuristic: long
/// enough for the service's ownership step on an idle box, short enough
/// not to eat the next window. Load-dependent, hence tunable.
pub const DEFAULT_SPIN_ITERATIONS: u32 = 50;

/// Detection wait per poll chunk; bounds cancellation latency.
pub const POLL_CHUNK_MS: u64 = 5;
pub const DEFAULT_DETECT_BUDGET_MS: u64 = 5;

/// Busy-poll burst after an event wake in hybrid mode.
pub const DEFAULT_HYBRID_BURST: u32 = 10_000;

pub const DEFAULT_TRIGGER_COUNT: u64 = 5000;
pub const DEFAULT_TRIGGER_DELAY_US: u64 = 500;

/// Service layout contract: per-subject base directory holding `Data`
/// (real), `Data_backup` (transient swap slot) and `Fake` (decoy).
pub fn container_base(subject: &str) -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join("Containers").join(subject))
}
