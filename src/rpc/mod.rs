//! Reverse calls: plugin code asking the trusted process for data mid-command.
//!
//! The trusted side binds a [`ReverseCallTable`] for the duration of one
//! forward command; its wait loop decodes every non-terminal packet into a
//! [`ReverseCall`] and lets the table answer it. The sandboxed side reaches
//! the same calls through the stubs in [`remote`]. Depth is bounded to one:
//! answering a reverse call never issues a forward command.

pub mod calls;
pub mod dispatch;
pub mod remote;
pub mod wire;

pub use calls::{InputSetCall, PerceptionCall, ReverseCall, TaskCall};
pub use dispatch::{DispatchOutcome, Reply, ReverseCallTable};
pub use remote::{RemoteInputSet, RemotePerception, RemoteTask};
