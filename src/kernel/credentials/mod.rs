//! Run-as identity for the sandboxed process.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid.

mod identity;
mod transition;
mod validation;

pub use identity::RunAsIdentity;
pub use transition::drop_to_identity;
pub use validation::validate_identity;
