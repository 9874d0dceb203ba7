//! Cooperative cancellation. SIGINT/SIGTERM set a flag that the race loop
//! checks at attempt boundaries and inside bounded waits; in-flight swaps
//! complete before cancellation is honoured.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    CANCELLED.store(true, Ordering::SeqCst);
}

pub fn install() -> io::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe {
            signal::sigaction(sig, &action)
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        }
    }
    Ok(())
}

pub fn cancelled() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}
