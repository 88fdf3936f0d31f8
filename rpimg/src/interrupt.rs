//! Ctrl-C handling.
//!
//! The handler only raises a flag. Long-running loops poll
//! [`flag`] and unwind through their normal cleanup paths.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Error, Result};

/// Set once SIGINT has been received.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Installs the SIGINT handler. Safe to call more than once.
#[cfg(unix)]
pub fn install() -> Result<()> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    #[allow(unsafe_code)]
    unsafe { sigaction(Signal::SIGINT, &action) }
        .map_err(|e| Error::Io(std::io::Error::from(e)))?;
    Ok(())
}

/// Installs the SIGINT handler. No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn install() -> Result<()> {
    Ok(())
}

/// SIGINT handler.
#[cfg(unix)]
extern "C" fn on_sigint(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// The flag itself, for code that takes a cancellation token.
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

/// Fails with [`Error::Interrupted`] once `cancel` has been raised.
pub fn check(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(Error::Interrupted);
    }
    Ok(())
}
