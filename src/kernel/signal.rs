use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static SIGPIPE_IGNORED: AtomicBool = AtomicBool::new(false);

/// Broken pipes must surface as `EPIPE` on the channel, not kill the process.
pub fn ignore_sigpipe() {
    if SIGPIPE_IGNORED.swap(true, Ordering::SeqCst) {
        return;
    }
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing SIG_IGN runs no handler code.
    if let Err(e) = unsafe { signal::sigaction(Signal::SIGPIPE, &action) } {
        SIGPIPE_IGNORED.store(false, Ordering::SeqCst);
        log::warn!("Failed to ignore SIGPIPE: {e}");
    }
}

/// Put crash signals back to their default action so a faulting plugin dumps core.
pub fn restore_crash_signals() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in [
        Signal::SIGSEGV,
        Signal::SIGBUS,
        Signal::SIGILL,
        Signal::SIGFPE,
        Signal::SIGABRT,
    ] {
        // SAFETY: installing SIG_DFL runs no handler code.
        if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
            log::warn!("Failed to restore default action for {sig}: {e}");
        }
    }
}

/// Human-readable name of a signal number.
pub fn signal_name(signo: i32) -> String {
    Signal::try_from(signo)
        .map(|sig| sig.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signo}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signals_have_names() {
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(9999), "signal 9999");
    }

    #[test]
    fn ignoring_sigpipe_is_idempotent() {
        ignore_sigpipe();
        ignore_sigpipe();
        assert!(SIGPIPE_IGNORED.load(Ordering::SeqCst));
    }
}
