//! Trusted side of a sandbox session.
//!
//! [`SandboxController`] owns the sandboxed process and the master end of
//! its channel. Loading and construction run the handshakes with the Warden
//! of the child armed; steady-state commands go through
//! [`SandboxController::request`], whose wait loop answers reverse calls
//! until the terminal response arrives.

pub mod controller;
pub mod diagnostics;
pub mod spawn;
pub mod types;

pub use controller::SandboxController;
pub use types::{ControllerState, LogFile, SessionReport, SpawnMode, TrainingListener};
