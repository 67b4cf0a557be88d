//! Processor-time watchdog of the sandboxed process.
//!
//! While a budgeted section runs, a real-time interval timer raises
//! `SIGALRM`. The handler compares the processor time spent since the section
//! started with its deadline: below it, the trusted side gets a `KeepAlive`
//! and the timer is re-armed for the rest; past it, the trusted side gets an
//! `Error` carrying the timeout code and the process exits.
//!
//! The handler only touches atomics and issues raw `write(2)`,
//! `getrusage(2)` and `setitimer(2)` calls.
use crate::config::types::ErrorCode;
use crate::protocol::MessageKind;
use crate::warden::reporter::{send_raw, StackPacket};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

/// Exit status of a process stopped by the watchdog.
pub const WATCHDOG_EXIT_STATUS: i32 = 1;

static REPORT_FD: AtomicI32 = AtomicI32::new(-1);
static STARTED_US: AtomicU64 = AtomicU64::new(0);
static DEADLINE_US: AtomicU64 = AtomicU64::new(0);
static TIMEOUT_CODE: AtomicU64 = AtomicU64::new(ErrorCode::HeuristicTimeout as u64);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Processor time (user and system) used by this process so far.
pub fn cpu_time() -> Duration {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the struct it is given.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return Duration::ZERO;
    }
    // SAFETY: zero-initialized and filled by a successful call.
    let usage = unsafe { usage.assume_init() };
    timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime)
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

fn set_timer(after: Duration) {
    let value = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: after.as_secs() as libc::time_t,
            tv_usec: after.subsec_micros() as libc::suseconds_t,
        },
    };
    // SAFETY: plain syscall on a stack value.
    unsafe {
        libc::setitimer(libc::ITIMER_REAL, &value, std::ptr::null_mut());
    }
}

extern "C" fn on_alarm(_signo: libc::c_int) {
    let fd = REPORT_FD.load(Ordering::SeqCst);
    let deadline = DEADLINE_US.load(Ordering::SeqCst);
    if fd < 0 || deadline == 0 {
        return;
    }
    let elapsed = (cpu_time().as_micros() as u64).saturating_sub(STARTED_US.load(Ordering::SeqCst));

    if elapsed >= deadline {
        let mut packet = StackPacket::new(MessageKind::Error);
        packet.push(&(TIMEOUT_CODE.load(Ordering::SeqCst) as u32).to_le_bytes());
        send_raw(fd, &packet);
        // SAFETY: async-signal-safe exit, nothing of the plugin's state is run.
        unsafe { libc::_exit(WATCHDOG_EXIT_STATUS) }
    }

    send_raw(fd, &StackPacket::new(MessageKind::KeepAlive));
    set_timer(Duration::from_micros(deadline - elapsed));
}

/// Install the `SIGALRM` handler and direct its reports to `report_fd`.
pub fn install(report_fd: RawFd, timeout_code: ErrorCode) -> nix::Result<()> {
    REPORT_FD.store(report_fd, Ordering::SeqCst);
    TIMEOUT_CODE.store(timeout_code.as_u32() as u64, Ordering::SeqCst);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let action = SigAction::new(SigHandler::Handler(on_alarm), SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handler is async-signal-safe, see the module documentation.
    if let Err(e) = unsafe { signal::sigaction(Signal::SIGALRM, &action) } {
        INSTALLED.store(false, Ordering::SeqCst);
        return Err(e);
    }
    Ok(())
}

/// One budgeted section. Dropping it stops the timer.
#[derive(Debug)]
pub struct Stopwatch {
    started: Duration,
    running: bool,
}

impl Stopwatch {
    /// Start measuring; with the handler installed, the process ends once
    /// `deadline` of processor time is spent.
    pub fn start(deadline: Duration) -> Self {
        let started = cpu_time();
        if INSTALLED.load(Ordering::SeqCst) && !deadline.is_zero() {
            STARTED_US.store(started.as_micros() as u64, Ordering::SeqCst);
            DEADLINE_US.store(deadline.as_micros().max(1) as u64, Ordering::SeqCst);
            set_timer(deadline);
        }
        Self {
            started,
            running: true,
        }
    }

    /// Processor time spent since `start`.
    pub fn stop(mut self) -> Duration {
        self.disarm();
        cpu_time().saturating_sub(self.started)
    }

    fn disarm(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        if INSTALLED.load(Ordering::SeqCst) {
            set_timer(Duration::ZERO);
            DEADLINE_US.store(0, Ordering::SeqCst);
        }
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        self.disarm();
    }
}
