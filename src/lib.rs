//! plugbox: run untrusted native plugins in a sandboxed child process.
//!
//! # Architecture
//!
//! A trusted controller and one sandboxed process per plugin family talk
//! over a pair of pipes carrying length-prefixed binary packets.
//!
//! ## Wire ([`protocol`], [`channel`])
//! - [`protocol`]: message kinds, field encodings, packet framing
//! - [`channel`]: blocking endpoint with timeouts and crash detection
//!
//! ## Trusted side ([`core`], [`proxy`])
//! - [`SandboxController`](crate::core::SandboxController): spawn, handshakes, wait loop, diagnostics
//! - [`proxy`]: heuristics, classifier, goal-planner and instruments stand-ins
//!
//! ## Sandboxed side ([`host`], [`warden`], [`kernel`])
//! - [`host`]: command loop, plugin registry and dynamic loading
//! - [`warden`]: memory budget and forbidden-call enforcement
//! - [`kernel`]: signals, rlimits, jail, identity drop and the processor-time watchdog
//!
//! ## Shared ([`plugin`], [`rpc`])
//! - [`plugin`]: role traits implemented by plugins and data interfaces
//! - [`rpc`]: reverse calls issued by plugins in the middle of a command
//!
//! ## Support
//! - [`config`]: configuration, error codes, error type
//! - [`observability`]: per-session logs and the audit trail
//! - [`utils`]: descriptor hygiene in the spawned child
//! - [`cli`]: command-line entry point, including the sandboxed role

// Wire
pub mod channel;
pub mod protocol;

// Enforcement inside the sandboxed process
pub mod kernel;
pub mod warden;

// Plugin surface and reverse calls
pub mod plugin;
pub mod rpc;

// Both halves of a session
pub mod core;
pub mod host;
pub mod proxy;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

pub mod cli;

pub use config::types::*;
