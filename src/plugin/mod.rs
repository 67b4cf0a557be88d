//! Plugin surface shared by both halves of the sandbox.
//!
//! The role traits ([`Heuristic`], [`Classifier`], [`GoalPlanner`],
//! [`Instrument`]) are what untrusted plugins implement. The data traits ([`InputSet`], [`Perception`],
//! [`Task`]) are implemented twice: by the trusted objects that own the data,
//! and by the remote stubs in `rpc::remote` that fetch it over the channel.

mod data;
mod roles;
mod types;

pub use data::{InputSet, Perception, Task};
pub use roles::{Classifier, GoalPlanner, Heuristic, Instrument, Notifier, RolePlugin};
pub use types::{
    ActionOutcome, ClassificationDone, ClassificationError, ClassifierFeatures, Coordinates,
    Dimensions, FeatureRef, HeuristicStatistics, Image, LabelScore, LabeledObject, ModelData,
    Parameter, PlannerFeatures, SavedModel, StatisticsEntry, TaskMode, TaskResult,
};

use crate::config::types::{ErrorCode, SandboxError};
use thiserror::Error;

/// Failure reported by plugin code or by a data interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct PluginError {
    pub code: ErrorCode,
    pub message: String,
}

impl PluginError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error with the code's own description as message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.description())
    }
}

impl From<SandboxError> for PluginError {
    fn from(err: SandboxError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<PluginError> for SandboxError {
    fn from(err: PluginError) -> Self {
        SandboxError::application(err.code, err.message)
    }
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;
