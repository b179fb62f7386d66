//! Shutdown signal flags.
//!
//! Handlers only flip atomics; the fuzz loop polls `pending()` at iteration
//! boundaries. No signal logic runs inside `execute`.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static TERMINATED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// SIGINT: checkpoint, flush, exit 0.
    Interrupt,
    /// SIGTERM: skip the checkpoint, write the final report, exit 0.
    Terminate,
}

extern "C" fn handle_signal(sig: libc::c_int) {
    match sig {
        libc::SIGINT => INTERRUPTED.store(true, Ordering::Relaxed),
        libc::SIGTERM => TERMINATED.store(true, Ordering::Relaxed),
        _ => {}
    }
}

/// Install the SIGINT/SIGTERM handlers. Safe to call more than once.
pub fn install() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as usize;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
}

/// The strongest pending shutdown request, if any. SIGTERM wins ties.
pub fn pending() -> Option<Shutdown> {
    if TERMINATED.load(Ordering::Relaxed) {
        Some(Shutdown::Terminate)
    } else if INTERRUPTED.load(Ordering::Relaxed) {
        Some(Shutdown::Interrupt)
    } else {
        None
    }
}

#[cfg(test)]
pub fn reset_for_tests() {
    INTERRUPTED.store(false, Ordering::Relaxed);
    TERMINATED.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_sets_the_matching_flag() {
        reset_for_tests();
        install();
        assert_eq!(pending(), None);

        unsafe {
            libc::raise(libc::SIGINT);
        }
        assert_eq!(pending(), Some(Shutdown::Interrupt));

        unsafe {
            libc::raise(libc::SIGTERM);
        }
        assert_eq!(pending(), Some(Shutdown::Terminate));
        reset_for_tests();
    }
}
