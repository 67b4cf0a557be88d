//! Resource Warden: in-process policy enforcement for the sandboxed process.
//!
//! The Warden lives in one process-local slot, filled once by
//! [`Warden::install`] and reached only through [`Warden::get`]. Two sources
//! feed it: [`WardenAllocator`] accounts every heap allocation, and the
//! interposed libc entry points (`interpose` feature) submit process and
//! file operations to [`Warden::guard`]. While armed, a violation is handed
//! to the installed [`WardenListener`] and the process exits; the Warden
//! never resumes the offending code.
//!
//! Memory is measured from the allocation level seen at install time, so
//! whatever the process inherited from its parent is not charged to plugins.

pub mod alloc;
#[cfg(all(target_os = "linux", feature = "interpose"))]
pub mod interpose;
pub mod policy;
pub mod reporter;

pub use alloc::WardenAllocator;
pub use policy::{GuardedPhase, Operation, Verdict};
pub use reporter::ChannelViolationReporter;

use crate::config::types::{Result, SandboxError};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

/// Exit status of a process terminated by the Warden.
pub const WARDEN_EXIT_STATUS: i32 = 2;

static SLOT: OnceCell<Warden> = OnceCell::new();

const NO_SUBJECT: u32 = u32::MAX;

/// What the Warden tells its listener about a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WardenStatus {
    MemoryLimitReached,
    ForbiddenCall,
}

/// A violation, delivered synchronously inside the offending process.
#[derive(Debug, Clone, Copy)]
pub struct Violation<'a> {
    pub status: WardenStatus,
    /// Denied operation, or the allocator entry point for memory violations
    pub operation: &'a str,
    /// Bytes above the install-time baseline
    pub allocated: u64,
    pub peak: u64,
    pub budget: u64,
    /// Index of the plugin whose code was running, when the host named one
    pub subject: Option<u32>,
}

/// Receives violations. Implementations must not rely on the caller resuming.
pub trait WardenListener: Send + Sync {
    fn on_violation(&self, violation: &Violation<'_>);
}

/// Point-in-time view of the Warden's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WardenContext {
    pub allocated: u64,
    pub peak: u64,
    pub baseline: u64,
    pub budget: u64,
    pub armed: bool,
    pub phase: Option<GuardedPhase>,
    pub subject: Option<u32>,
}

pub struct Warden {
    budget: AtomicU64,
    baseline: AtomicU64,
    peak: AtomicU64,
    subject: AtomicU32,
    armed: AtomicBool,
    phase: AtomicU8,
    allowed_roots: Mutex<Vec<PathBuf>>,
    listener: Box<dyn WardenListener>,
}

impl Warden {
    /// Fill the process slot. Fails if a Warden is already installed.
    pub fn install(
        budget: u64,
        allowed_roots: Vec<PathBuf>,
        listener: Box<dyn WardenListener>,
    ) -> Result<&'static Warden> {
        let warden = Warden {
            budget: AtomicU64::new(budget),
            baseline: AtomicU64::new(alloc::allocated()),
            peak: AtomicU64::new(0),
            subject: AtomicU32::new(NO_SUBJECT),
            armed: AtomicBool::new(false),
            phase: AtomicU8::new(0),
            allowed_roots: Mutex::new(allowed_roots),
            listener,
        };
        SLOT.set(warden)
            .map_err(|_| SandboxError::InvalidState("a Warden is already installed".to_string()))?;

        if !alloc::allocator_active() {
            log::warn!("WardenAllocator is not the global allocator: memory budget not enforced");
        }
        log::info!(
            "Warden installed (budget {budget} bytes above {} inherited)",
            alloc::allocated()
        );
        SLOT.get()
            .ok_or_else(|| SandboxError::InvalidState("Warden slot is empty".to_string()))
    }

    /// The installed Warden, if any.
    pub fn get() -> Option<&'static Warden> {
        SLOT.get()
    }

    pub fn context(&self) -> WardenContext {
        WardenContext {
            allocated: self.used(alloc::allocated()),
            peak: self.peak.load(Ordering::Relaxed),
            baseline: self.baseline.load(Ordering::Relaxed),
            budget: self.budget.load(Ordering::Relaxed),
            armed: self.is_armed(),
            phase: self.phase(),
            subject: self.subject(),
        }
    }

    /// Name the plugin whose code runs next; `None` once the host is back in control.
    pub fn set_subject(&self, subject: Option<u32>) {
        self.subject
            .store(subject.unwrap_or(NO_SUBJECT), Ordering::Release);
    }

    pub fn subject(&self) -> Option<u32> {
        match self.subject.load(Ordering::Acquire) {
            NO_SUBJECT => None,
            index => Some(index),
        }
    }

    /// Start a new peak measurement from the current level.
    pub fn restart_peak(&self) {
        self.peak
            .store(self.used(alloc::allocated()), Ordering::Relaxed);
    }

    fn used(&self, allocated: u64) -> u64 {
        allocated.saturating_sub(self.baseline.load(Ordering::Relaxed))
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Option<GuardedPhase> {
        GuardedPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_budget(&self, budget: u64) {
        self.budget.store(budget, Ordering::Relaxed);
    }

    pub fn add_allowed_root(&self, root: PathBuf) {
        if let Ok(mut roots) = self.allowed_roots.lock() {
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
    }

    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        self.allowed_roots
            .lock()
            .map(|roots| roots.clone())
            .unwrap_or_default()
    }

    /// Start enforcing for an untrusted section.
    pub fn arm(&self, phase: GuardedPhase) {
        #[cfg(all(target_os = "linux", feature = "interpose"))]
        interpose::ensure_linked();

        self.phase.store(phase as u8, Ordering::Release);
        self.armed.store(true, Ordering::Release);
        log::debug!("Warden armed for {phase}");
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
        self.phase.store(0, Ordering::Release);
    }

    /// Gate an intercepted operation. Returns only if it may proceed.
    pub fn guard(operation: Operation<'_>) {
        let Some(warden) = Warden::get() else {
            return;
        };
        if !warden.is_armed() {
            return;
        }

        let roots = warden.allowed_roots();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        if policy::evaluate(&operation, &roots, &cwd) == Verdict::Allow {
            return;
        }
        let operation = operation.describe();
        warden.trip(WardenStatus::ForbiddenCall, &operation);
    }

    /// Account-side check used by the allocator, with the process-wide total.
    #[inline]
    pub(crate) fn over_budget(&self, allocated: u64) -> bool {
        let used = self.used(allocated);
        self.peak.fetch_max(used, Ordering::Relaxed);
        self.is_armed() && used > self.budget.load(Ordering::Relaxed)
    }

    /// Report a violation and terminate the process.
    pub(crate) fn trip(&self, status: WardenStatus, operation: &str) -> ! {
        self.disarm();
        let violation = Violation {
            status,
            operation,
            allocated: self.used(alloc::allocated()),
            peak: self.peak.load(Ordering::Relaxed),
            budget: self.budget.load(Ordering::Relaxed),
            subject: self.subject(),
        };
        self.listener.on_violation(&violation);
        unsafe { libc::_exit(WARDEN_EXIT_STATUS) }
    }
}

/// Disarms the Warden when dropped, so an early return cannot leave it armed.
pub struct ArmedSection {
    warden: Option<&'static Warden>,
}

impl ArmedSection {
    /// Arm the installed Warden, if any, until the guard is dropped.
    pub fn enter(phase: GuardedPhase) -> Self {
        let warden = Warden::get();
        if let Some(warden) = warden {
            warden.arm(phase);
        }
        Self { warden }
    }
}

impl Drop for ArmedSection {
    fn drop(&mut self) {
        if let Some(warden) = self.warden {
            warden.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl WardenListener for Silent {
        fn on_violation(&self, _violation: &Violation<'_>) {}
    }

    fn warden(baseline: u64, budget: u64) -> Warden {
        Warden {
            budget: AtomicU64::new(budget),
            baseline: AtomicU64::new(baseline),
            peak: AtomicU64::new(0),
            subject: AtomicU32::new(NO_SUBJECT),
            armed: AtomicBool::new(false),
            phase: AtomicU8::new(0),
            allowed_roots: Mutex::new(Vec::new()),
            listener: Box::new(Silent),
        }
    }

    #[test]
    fn inherited_allocations_are_not_charged() {
        let warden = warden(80 << 20, 64 << 20);
        warden.arm(GuardedPhase::Construction);

        assert!(!warden.over_budget(100 << 20));
        assert!(!warden.over_budget(144 << 20));
        assert!(warden.over_budget((144 << 20) + 1));
        assert_eq!(warden.context().peak, (64 << 20) + 1);
        assert_eq!(warden.context().baseline, 80 << 20);
    }

    #[test]
    fn release_below_the_baseline_counts_as_nothing() {
        let warden = warden(10 << 20, 1 << 20);
        warden.arm(GuardedPhase::Loading);
        assert!(!warden.over_budget(2 << 20));
        assert_eq!(warden.used(2 << 20), 0);
    }

    #[test]
    fn disarmed_warden_only_tracks_the_peak() {
        let warden = warden(0, 1024);
        assert!(!warden.over_budget(4096));
        assert_eq!(warden.context().peak, 4096);
        assert!(!warden.context().armed);
    }

    #[test]
    fn subject_is_cleared_with_none() {
        let warden = warden(0, 1024);
        assert_eq!(warden.subject(), None);
        warden.set_subject(Some(2));
        assert_eq!(warden.context().subject, Some(2));
        warden.set_subject(None);
        assert_eq!(warden.subject(), None);
    }
}
