//! Thin wrappers around the Linux primitives the sandboxed process relies on.
//!
//! `unsafe` syscall wrappers are concentrated here.
//! Order used by the sandbox host: signal -> limits -> jail -> credentials.

pub mod credentials;
pub mod jail;
pub mod limits;
pub mod process;
pub mod signal;
pub mod watchdog;
