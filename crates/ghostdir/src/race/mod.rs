//! Race coordinator: drives trigger, detection, swap and verification
//! as one attempt loop, keeps counters, and guarantees the triad is
//! reconciled on every exit path.

pub mod detect;

use std::fmt;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config;
use crate::fsops::{DirectoryTriad, SwapOutcome};
use crate::signals;
use crate::trigger::source::TriggerSource;
use crate::trigger::{TriggerError, TriggerOutcome};
use detect::{wait_for_detection, DirWatch, Strategy};

#[derive(Debug, Error)]
pub enum RaceError {
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    /// Triad repair failed; the layout on disk needs manual attention.
    #[error("directory layout corrupt beyond repair")]
    Corrupt(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub strategy: Strategy,
    pub max_attempts: u64,
    pub wall_timeout: Duration,
    pub detect_budget: Duration,
    pub spin_iterations: u32,
    pub hybrid_burst: u32,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Hybrid,
            max_attempts: config::DEFAULT_MAX_ATTEMPTS,
            wall_timeout: Duration::from_secs(config::DEFAULT_TIMEOUT_SECS),
            detect_budget: Duration::from_millis(config::DEFAULT_DETECT_BUDGET_MS),
            spin_iterations: config::DEFAULT_SPIN_ITERATIONS,
            hybrid_burst: config::DEFAULT_HYBRID_BURST,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RaceStats {
    pub triggers: u64,
    pub detections: u64,
    pub swaps: u64,
    pub swap_failures: u64,
    pub wins: u64,
}

impl fmt::Display for RaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "triggers={} detections={} swaps={} swap_failures={} wins={}",
            self.triggers, self.detections, self.swaps, self.swap_failures, self.wins
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    Won,
    /// Attempt or wall-clock budget ran out.
    Exhausted,
    Cancelled,
}

/// Per-attempt record, mostly for the debug log.
#[derive(Debug, Clone, Copy)]
pub struct RaceAttempt {
    pub seq: u64,
    pub detected: bool,
    pub swap: Option<SwapOutcome>,
    pub won: bool,
}

/// How a won attempt is recognised. The production check looks at
/// ownership; tests substitute their own oracle.
pub trait WinCheck {
    fn won(&mut self) -> bool;
}

pub struct OwnershipCheck {
    target: PathBuf,
    uid: u32,
}

impl OwnershipCheck {
    pub fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            uid: unsafe { libc::getuid() },
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }
}

impl WinCheck for OwnershipCheck {
    fn won(&mut self) -> bool {
        std::fs::metadata(&self.target)
            .map(|meta| meta.uid() == self.uid)
            .unwrap_or(false)
    }
}

/// Reconciles the triad when dropped, so the on-disk layout is restored
/// whether the run wins, exhausts, is cancelled, or unwinds on error.
struct TriadGuard(DirectoryTriad);

impl Drop for TriadGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.reconcile() {
            warn!("[Race] exit reconcile failed: {e}");
        }
    }
}

pub struct RaceCoordinator<T: TriggerSource, W: WinCheck> {
    triad: DirectoryTriad,
    trigger: T,
    win: W,
    cfg: RaceConfig,
    stats: RaceStats,
}

impl<T: TriggerSource, W: WinCheck> RaceCoordinator<T, W> {
    pub fn new(triad: DirectoryTriad, trigger: T, win: W, cfg: RaceConfig) -> Self {
        Self {
            triad,
            trigger,
            win,
            cfg,
            stats: RaceStats::default(),
        }
    }

    pub fn stats(&self) -> RaceStats {
        self.stats
    }

    pub fn run(&mut self) -> Result<RunVerdict, RaceError> {
        self.triad.reconcile().map_err(RaceError::Corrupt)?;
        let _cleanup = TriadGuard(self.triad.clone());

        let start = Instant::now();
        let mut last_progress = start;
        let mut seq: u64 = 0;
        let verdict = loop {
            if signals::cancelled() {
                info!("[Race] cancelled after {seq} attempts");
                break RunVerdict::Cancelled;
            }
            if seq >= self.cfg.max_attempts {
                info!("[Race] attempt budget exhausted ({seq})");
                break RunVerdict::Exhausted;
            }
            if start.elapsed() >= self.cfg.wall_timeout {
                info!("[Race] wall-clock budget exhausted after {seq} attempts");
                break RunVerdict::Exhausted;
            }

            let attempt = self.attempt(seq);
            debug!("[Race] {attempt:?}");
            if attempt.won {
                info!("[Race] attempt {seq} won");
                break RunVerdict::Won;
            }

            if last_progress.elapsed() >= Duration::from_secs(1) {
                info!("[Race] attempt {seq}: {}", self.stats);
                last_progress = Instant::now();
            }
            seq += 1;
        };
        Ok(verdict)
    }

    fn attempt(&mut self, seq: u64) -> RaceAttempt {
        let mut attempt = RaceAttempt {
            seq,
            detected: false,
            swap: None,
            won: false,
        };

        // A stale Data/tmp makes the service skip its creation step and
        // the window never opens.
        self.triad.clear_real_tmp();

        // Arm before firing; the create can land microseconds after the
        // request goes out.
        let watch = match DirWatch::arm(self.triad.real()) {
            Ok(watch) => watch,
            Err(e) => {
                warn!("[Race] failed to arm watch: {e}");
                return attempt;
            }
        };

        self.stats.triggers += 1;
        match self.trigger.fire() {
            TriggerOutcome::Success { .. } => {}
            TriggerOutcome::SendFailed => {
                debug!("[Race] attempt {seq}: trigger send failed");
            }
            TriggerOutcome::ReceiveTimeout => {
                debug!("[Race] attempt {seq}: trigger reply timed out");
            }
        }

        attempt.detected = wait_for_detection(
            self.cfg.strategy,
            &watch,
            self.triad.real_tmp(),
            self.cfg.detect_budget,
            self.cfg.hybrid_burst,
        );
        drop(watch);
        if !attempt.detected {
            return attempt;
        }
        self.stats.detections += 1;

        let outcome = self.triad.swap();
        attempt.swap = Some(outcome);
        match outcome {
            SwapOutcome::Success => {
                self.stats.swaps += 1;
                // Let the service's in-flight ownership step land on the
                // decoy's hard link.
                for _ in 0..self.cfg.spin_iterations {
                    std::hint::spin_loop();
                }
                if self.win.won() {
                    attempt.won = true;
                    self.stats.wins += 1;
                } else {
                    self.triad.rollback();
                }
            }
            SwapOutcome::FailStage1 => {
                self.stats.swap_failures += 1;
            }
            SwapOutcome::FailStage2 => {
                self.stats.swap_failures += 1;
                if let Err(e) = self.triad.reconcile() {
                    warn!("[Race] reconcile after stage 2 failure: {e}");
                }
            }
        }
        attempt
    }
}
