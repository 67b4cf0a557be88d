//! Processor-time budgets of heuristics.
//!
//! Each heuristic starts with an initialization allowance. Every sequence,
//! image pixel, ROI pixel and batch of features grants more, capped at
//! [`BUDGET_MAXIMUM`]; every call spends what it used. A heuristic whose
//! budget runs out fails with a timeout.
use std::time::Duration;

pub const BUDGET_INITIALIZATION: Duration = Duration::from_secs(2);
pub const BUDGET_PER_SEQUENCE: Duration = Duration::from_millis(500);
pub const BUDGET_PER_PIXEL: Duration = Duration::from_micros(1);
pub const BUDGET_PER_FEATURE: Duration = Duration::from_micros(10);
pub const BUDGET_MAXIMUM: Duration = Duration::from_secs(1);

/// Grace added to the remaining budget before the watchdog ends the process.
pub const ADDITIONAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Features computed between two budget checks.
pub const FEATURES_PER_BATCH: usize = 100;

/// Pixel work units granted for `pixels` pixels: `n log n`, at least `n`.
pub fn pixel_work(pixels: u64) -> u32 {
    let n = pixels as f64;
    let work = if pixels > 1 { (n * n.ln()).max(n) } else { n };
    work.min(u32::MAX as f64) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    remaining: Duration,
}

impl Default for TimeBudget {
    fn default() -> Self {
        Self {
            remaining: BUDGET_INITIALIZATION,
        }
    }
}

impl TimeBudget {
    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Add `units` times `unit`, without going above the maximum.
    pub fn grant(&mut self, unit: Duration, units: u32) {
        let granted = self.remaining.saturating_add(unit.saturating_mul(units));
        self.remaining = granted.min(BUDGET_MAXIMUM);
    }

    /// Spend `elapsed`. `false` once nothing is left.
    pub fn spend(&mut self, elapsed: Duration) -> bool {
        match self.remaining.checked_sub(elapsed) {
            Some(rest) if !rest.is_zero() => {
                self.remaining = rest;
                true
            }
            _ => {
                self.remaining = Duration::ZERO;
                false
            }
        }
    }

    /// Processor time the next call may use before the watchdog fires.
    pub fn deadline(&self) -> Duration {
        self.remaining + ADDITIONAL_TIMEOUT
    }
}
