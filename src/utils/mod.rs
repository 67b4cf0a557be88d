//! Utilities
//!
//! Descriptor hygiene for freshly spawned sandboxed processes.

pub mod fd_closure;
