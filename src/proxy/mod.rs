//! Trusted-side stand-ins for sandboxed plugins.
//!
//! Each proxy owns a [`SandboxController`] of its kind and turns role methods
//! into forward commands. Before every command it records a context string
//! describing the call, and it binds the reverse-call table to the data
//! object the command concerns for the duration of that command only.

mod classifier;
mod context;
mod heuristics;
mod instruments;
mod planner;

pub use classifier::SandboxedClassifier;
pub use context::CommandContext;
pub use heuristics::SandboxedHeuristics;
pub use instruments::SandboxedInstruments;
pub use planner::SandboxedPlanner;

use crate::config::types::{Result, SandboxError};
use crate::core::SandboxController;
use std::path::PathBuf;

/// Record `context` for the next command, unless the session already failed.
///
/// The context of the failed command is kept for diagnostics.
fn begin(controller: &mut SandboxController, context: CommandContext) -> Result<()> {
    let state = controller.state();
    if state.is_terminal() {
        return Err(SandboxError::InvalidState(format!(
            "{} sandbox is {state:?}, command refused",
            controller.kind()
        )));
    }
    controller.set_context(context.finish());
    Ok(())
}

/// Load a predictor plugin, hand it its model files and construct it.
fn load_predictor(
    controller: &mut SandboxController,
    name: &str,
    model: Option<PathBuf>,
    internal_data: Option<PathBuf>,
) -> Result<()> {
    begin(controller, CommandContext::method("loading"))?;
    controller.load_plugin(name)?;

    let mut context = CommandContext::method("constructor");
    context = match &model {
        Some(path) => context.parameter("Model", path.display()),
        None => context.item("No model"),
    };
    if let Some(path) = &internal_data {
        context = context.parameter("Internal data", path.display());
    }
    begin(controller, context)?;
    controller.use_model(model, internal_data)?;
    controller.create_plugins()
}
