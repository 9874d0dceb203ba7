//! Detection strategies for the creation event.
//!
//! All three share one contract: block until `Data/tmp` shows up as a
//! directory or the budget elapses. The inotify wake is only a hint;
//! the lstat is the proof.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

use clap::ValueEnum;

use crate::config;
use crate::signals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Repeated lstat. Lowest latency, burns a core.
    BusyPoll,
    /// Block on the watch with a short timeout. Cheap, but can miss
    /// sub-millisecond windows on a loaded box.
    EventWait,
    /// Block on the watch, then busy-poll for a bounded burst once woken.
    Hybrid,
}

/// One-shot inotify watch on the real directory, armed per attempt.
/// Releases the watch and the fd on every exit path.
pub struct DirWatch {
    fd: OwnedFd,
    wd: libc::c_int,
}

impl DirWatch {
    pub fn arm(dir: &Path) -> io::Result<Self> {
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let cpath = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let mask = libc::IN_CREATE | libc::IN_MOVED_TO | libc::IN_ONESHOT;
        let wd = unsafe { libc::inotify_add_watch(fd.as_raw_fd(), cpath.as_ptr(), mask) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, wd })
    }

    fn wait_event(&self, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe { libc::poll(&mut pfd, 1, millis) };
        n > 0 && (pfd.revents & libc::POLLIN) != 0
    }

    fn drain(&self) {
        let mut buf = [0u8; 1024];
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for DirWatch {
    fn drop(&mut self) {
        // A fired one-shot watch is already gone kernel-side; EINVAL here
        // is expected.
        unsafe {
            libc::inotify_rm_watch(self.fd.as_raw_fd(), self.wd);
        }
    }
}

/// The lstat confirmation behind every strategy.
pub fn confirmed(tmp: &Path) -> bool {
    tmp.symlink_metadata()
        .map(|meta| meta.file_type().is_dir())
        .unwrap_or(false)
}

pub fn wait_for_detection(
    strategy: Strategy,
    watch: &DirWatch,
    tmp: &Path,
    budget: Duration,
    hybrid_burst: u32,
) -> bool {
    let deadline = Instant::now() + budget;
    match strategy {
        Strategy::BusyPoll => busy_poll(tmp, deadline),
        Strategy::EventWait => event_wait(watch, tmp, deadline),
        Strategy::Hybrid => hybrid(watch, tmp, deadline, hybrid_burst),
    }
}

fn busy_poll(tmp: &Path, deadline: Instant) -> bool {
    let mut spins: u32 = 0;
    while Instant::now() < deadline {
        if confirmed(tmp) {
            return true;
        }
        spins = spins.wrapping_add(1);
        if spins % 256 == 0 && signals::cancelled() {
            return false;
        }
        std::hint::spin_loop();
    }
    false
}

fn event_wait(watch: &DirWatch, tmp: &Path, deadline: Instant) -> bool {
    let chunk = Duration::from_millis(config::POLL_CHUNK_MS);
    loop {
        let now = Instant::now();
        if now >= deadline || signals::cancelled() {
            return false;
        }
        if watch.wait_event((deadline - now).min(chunk)) {
            watch.drain();
            if confirmed(tmp) {
                return true;
            }
        }
    }
}

fn hybrid(watch: &DirWatch, tmp: &Path, deadline: Instant, burst: u32) -> bool {
    let chunk = Duration::from_millis(config::POLL_CHUNK_MS);
    loop {
        let now = Instant::now();
        if now >= deadline || signals::cancelled() {
            return false;
        }
        if watch.wait_event((deadline - now).min(chunk)) {
            watch.drain();
            // Tight reaction once woken: the create may land a hair after
            // the event is queued.
            for _ in 0..burst {
                if confirmed(tmp) {
                    return true;
                }
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use tempfile::TempDir;

    fn detect_after_delayed_create(strategy: Strategy) -> bool {
        let dir = TempDir::new().expect("tempdir");
        let tmp = dir.path().join("tmp");
        let watch = DirWatch::arm(dir.path()).expect("arm");

        let create_at = tmp.clone();
        let creator = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            fs::create_dir(&create_at).expect("create");
        });
        let detected = wait_for_detection(
            strategy,
            &watch,
            &tmp,
            Duration::from_secs(2),
            config::DEFAULT_HYBRID_BURST,
        );
        creator.join().expect("creator");
        detected
    }

    #[test]
    fn busy_poll_detects_creation() {
        assert!(detect_after_delayed_create(Strategy::BusyPoll));
    }

    #[test]
    fn event_wait_detects_creation() {
        assert!(detect_after_delayed_create(Strategy::EventWait));
    }

    #[test]
    fn hybrid_detects_creation() {
        assert!(detect_after_delayed_create(Strategy::Hybrid));
    }

    #[test]
    fn zero_budget_never_detects() {
        let dir = TempDir::new().expect("tempdir");
        let tmp = dir.path().join("tmp");
        fs::create_dir(&tmp).expect("create");
        let watch = DirWatch::arm(dir.path()).expect("arm");
        for strategy in [Strategy::BusyPoll, Strategy::EventWait, Strategy::Hybrid] {
            assert!(!wait_for_detection(
                strategy,
                &watch,
                &tmp,
                Duration::ZERO,
                config::DEFAULT_HYBRID_BURST,
            ));
        }
    }

    #[test]
    fn notification_alone_is_not_detection() {
        // A file create wakes the watch, but confirmation requires a
        // directory named tmp.
        let dir = TempDir::new().expect("tempdir");
        let tmp = dir.path().join("tmp");
        let watch = DirWatch::arm(dir.path()).expect("arm");

        let other = dir.path().join("unrelated");
        let creator = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            fs::File::create(&other).expect("create file");
        });
        let detected = wait_for_detection(
            Strategy::EventWait,
            &watch,
            &tmp,
            Duration::from_millis(150),
            0,
        );
        creator.join().expect("creator");
        assert!(!detected);
    }
}
