use crate::config::types::{ErrorCode, PluginKind};
use crate::host::PluginRegistry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Life cycle of one sandbox session, as seen by its controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Unborn,
    ChannelReady,
    Loaded,
    Ready,
    Crashed,
    TimedOut,
    Closed,
}

impl ControllerState {
    /// No command can succeed from this state on.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::TimedOut | Self::Closed)
    }

    pub fn has_process(self) -> bool {
        !matches!(self, Self::Unborn | Self::Closed)
    }
}

/// Receiver of the training progress a sandboxed predictor reports.
pub trait TrainingListener {
    fn training_step_done(&mut self, step: u32, nb_steps: u32);
}

impl<F: FnMut(u32, u32)> TrainingListener for F {
    fn training_step_done(&mut self, step: u32, nb_steps: u32) {
        self(step, nb_steps)
    }
}

/// How the sandboxed process is started.
#[derive(Clone, Debug)]
pub enum SpawnMode {
    /// Re-execute `program` with the hidden `sandbox` subcommand
    Exec { program: PathBuf },
    /// Run the host in the forked child directly, with the given plugins
    InProcess(PluginRegistry),
}

/// One log file of a session, as handed to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    pub name: String,
    pub path: PathBuf,
    pub content: String,
}

/// Outcome of a complete create/load/construct/ping/close round, as printed
/// by the `check` command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionReport {
    pub kind: PluginKind,
    pub plugin: String,
    pub success: bool,
    pub state: ControllerState,
    pub error_code: ErrorCode,
    pub error: Option<String>,
    pub context: Option<String>,
    pub stack_trace: Option<String>,
    pub sandbox_pid: Option<i32>,
    pub elapsed_ms: u64,
    /// SHA256 of the configuration the session ran with
    pub config_fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_terminal() {
        for state in [ControllerState::Crashed, ControllerState::TimedOut, ControllerState::Closed] {
            assert!(state.is_terminal());
        }
        assert!(!ControllerState::Ready.is_terminal());
        assert!(ControllerState::TimedOut.has_process());
        assert!(!ControllerState::Unborn.has_process());
    }
}
