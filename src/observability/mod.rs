//! Observability
//!
//! Per-session text logs and the JSON-lines audit trail.

pub mod audit;
pub mod session_log;
