//! Configuration
//!
//! Session configuration, the wire error vocabulary and the crate-wide error type.

pub mod types;
