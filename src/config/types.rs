/// Core types shared by both halves of the sandbox: error vocabulary,
/// plugin kinds, lifecycle phases and the session configuration.
use crate::channel::ChannelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default byte budget enforced by the Warden inside a sandboxed process.
pub const DEFAULT_MEMORY_BUDGET: u64 = 2 * 1024 * 1024 * 1024;

/// Time allowed for the child to answer the creation handshake.
pub const DEFAULT_CREATION_TIMEOUT_MS: u64 = 5_000;

/// Time allowed for any other command.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Wire error vocabulary. Values are part of the protocol and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,

    ChannelSlaveCrashed = 1,
    ChannelSlaveTimeout = 2,
    ChannelProtocol = 3,
    ChannelUnexpectedResponse = 4,
    ChannelEndOfPacket = 5,
    ChannelIo = 6,

    SandboxCreation = 10,
    Fork = 11,
    SandboxMemoryLimitReached = 12,
    SandboxForbiddenSystemCall = 13,
    Warden = 14,
    InvalidState = 15,
    Configuration = 16,

    PluginsFolderNotSet = 20,
    PluginNotFound = 21,
    PluginLoadingFailed = 22,
    PluginConstructionFailed = 23,
    PluginKindMismatch = 24,
    NoPluginLoaded = 25,

    HeuristicCrashed = 30,
    HeuristicTimeout = 31,
    ClassifierCrashed = 32,
    PlannerCrashed = 33,
    InstrumentCrashed = 34,

    SetupFailed = 40,
    ModelLoadingFailed = 41,
    ModelMissingHeuristic = 42,
    ModelSavingFailed = 43,
    TrainingFailed = 44,
    ClassificationFailed = 45,
    LearningFailed = 46,
    InvalidArguments = 47,
    AppServerError = 48,
    FeatureNotANumber = 49,
    UnknownCommand = 50,
}

impl ErrorCode {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a wire value; `None` for values outside the vocabulary.
    pub const fn from_u32(value: u32) -> Option<Self> {
        let code = match value {
            0 => Self::None,
            1 => Self::ChannelSlaveCrashed,
            2 => Self::ChannelSlaveTimeout,
            3 => Self::ChannelProtocol,
            4 => Self::ChannelUnexpectedResponse,
            5 => Self::ChannelEndOfPacket,
            6 => Self::ChannelIo,
            10 => Self::SandboxCreation,
            11 => Self::Fork,
            12 => Self::SandboxMemoryLimitReached,
            13 => Self::SandboxForbiddenSystemCall,
            14 => Self::Warden,
            15 => Self::InvalidState,
            16 => Self::Configuration,
            20 => Self::PluginsFolderNotSet,
            21 => Self::PluginNotFound,
            22 => Self::PluginLoadingFailed,
            23 => Self::PluginConstructionFailed,
            24 => Self::PluginKindMismatch,
            25 => Self::NoPluginLoaded,
            30 => Self::HeuristicCrashed,
            31 => Self::HeuristicTimeout,
            32 => Self::ClassifierCrashed,
            33 => Self::PlannerCrashed,
            34 => Self::InstrumentCrashed,
            40 => Self::SetupFailed,
            41 => Self::ModelLoadingFailed,
            42 => Self::ModelMissingHeuristic,
            43 => Self::ModelSavingFailed,
            44 => Self::TrainingFailed,
            45 => Self::ClassificationFailed,
            46 => Self::LearningFailed,
            47 => Self::InvalidArguments,
            48 => Self::AppServerError,
            49 => Self::FeatureNotANumber,
            50 => Self::UnknownCommand,
            _ => return None,
        };
        Some(code)
    }

    /// Codes a sandboxed process may report without ending its session:
    /// state and loading refusals plus application failures.
    pub const fn is_recoverable(self) -> bool {
        matches!(self.as_u32(), 15 | 20..=25 | 40..=50)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::None => "No error",
            Self::ChannelSlaveCrashed => "The sandboxed process crashed",
            Self::ChannelSlaveTimeout => "The sandboxed process did not answer in time",
            Self::ChannelProtocol => "Protocol error on the communication channel",
            Self::ChannelUnexpectedResponse => "Unexpected response on the communication channel",
            Self::ChannelEndOfPacket => "Attempted to read past the end of a packet",
            Self::ChannelIo => "I/O failure on the communication channel",
            Self::SandboxCreation => "Failed to create the sandbox",
            Self::Fork => "Failed to spawn the sandboxed process",
            Self::SandboxMemoryLimitReached => "The plugin exceeded its memory budget",
            Self::SandboxForbiddenSystemCall => "The plugin attempted a forbidden system call",
            Self::Warden => "The Warden reported a failure",
            Self::InvalidState => "Operation not allowed in the current sandbox state",
            Self::Configuration => "Invalid sandbox configuration",
            Self::PluginsFolderNotSet => "The plugins folder was not set",
            Self::PluginNotFound => "Plugin not found",
            Self::PluginLoadingFailed => "Failed to load the plugin",
            Self::PluginConstructionFailed => "Failed to construct the plugin",
            Self::PluginKindMismatch => "The plugin does not implement the expected role",
            Self::NoPluginLoaded => "No plugin was loaded",
            Self::HeuristicCrashed => "The heuristic crashed",
            Self::HeuristicTimeout => "The heuristic did not answer in time",
            Self::ClassifierCrashed => "The classifier crashed",
            Self::PlannerCrashed => "The goal-planner crashed",
            Self::InstrumentCrashed => "The instrument crashed",
            Self::SetupFailed => "The plugin failed to setup itself",
            Self::ModelLoadingFailed => "The plugin failed to load its model",
            Self::ModelMissingHeuristic => "The model uses a heuristic that is not available",
            Self::ModelSavingFailed => "The plugin failed to save its model",
            Self::TrainingFailed => "The classifier failed to train",
            Self::ClassificationFailed => "The classifier failed to classify",
            Self::LearningFailed => "The goal-planner failed to learn",
            Self::InvalidArguments => "Invalid arguments",
            Self::AppServerError => "The trusted side failed to answer",
            Self::FeatureNotANumber => "A computed feature is not a number",
            Self::UnknownCommand => "Unknown command",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Role implemented by the plugins of one sandbox session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Heuristics,
    Classifier,
    GoalPlanner,
    Instruments,
}

impl PluginKind {
    /// Name used on the command line of the sandboxed process.
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Heuristics => "heuristics",
            Self::Classifier => "classifier",
            Self::GoalPlanner => "goalplanner",
            Self::Instruments => "instruments",
        }
    }

    pub fn from_arg(value: &str) -> Option<Self> {
        match value {
            "heuristics" => Some(Self::Heuristics),
            "classifier" => Some(Self::Classifier),
            "goalplanner" => Some(Self::GoalPlanner),
            "instruments" => Some(Self::Instruments),
            _ => None,
        }
    }

    /// Component-specific code a channel crash is re-tagged into.
    pub fn crash_code(self) -> ErrorCode {
        match self {
            Self::Heuristics => ErrorCode::HeuristicCrashed,
            Self::Classifier => ErrorCode::ClassifierCrashed,
            Self::GoalPlanner => ErrorCode::PlannerCrashed,
            Self::Instruments => ErrorCode::InstrumentCrashed,
        }
    }

    /// Prefix of the log files written for this kind of session.
    pub fn log_name(self) -> &'static str {
        match self {
            Self::Heuristics => "HeuristicsSandbox",
            Self::Classifier => "ClassifierSandbox",
            Self::GoalPlanner => "GoalPlannerSandbox",
            Self::Instruments => "InstrumentsSandbox",
        }
    }

    /// Classifiers and goal-planners carry a model.
    pub fn is_predictor(self) -> bool {
        matches!(self, Self::Classifier | Self::GoalPlanner)
    }

    /// Whether one session may host several plugins of this kind.
    pub fn allows_many(self) -> bool {
        matches!(self, Self::Heuristics | Self::Instruments)
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Heuristics => "heuristic",
            Self::Classifier => "classifier",
            Self::GoalPlanner => "goal-planner",
            Self::Instruments => "instrument",
        };
        f.write_str(label)
    }
}

/// Part of the session life cycle an error happened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Creation,
    Loading,
    Construction,
    Command,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Creation => "creation",
            Self::Loading => "loading",
            Self::Construction => "construction",
            Self::Command => "command",
        };
        f.write_str(label)
    }
}

/// Policy violation reported by the Warden of a sandboxed process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyViolation {
    MemoryLimit { peak: u64, budget: u64 },
    ForbiddenCall { operation: String },
    Warden { details: String },
}

impl PolicyViolation {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MemoryLimit { .. } => ErrorCode::SandboxMemoryLimitReached,
            Self::ForbiddenCall { .. } => ErrorCode::SandboxForbiddenSystemCall,
            Self::Warden { .. } => ErrorCode::Warden,
        }
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryLimit { peak, budget } => {
                write!(f, "memory limit reached (peak {peak} bytes, budget {budget} bytes)")
            }
            Self::ForbiddenCall { operation } => write!(f, "forbidden system call: {operation}"),
            Self::Warden { details } => write!(f, "warden failure: {details}"),
        }
    }
}

/// Crate-wide error type.
///
/// Variants follow the severity order of the failure taxonomy: transport,
/// crash, timeout and policy failures are fatal to the session; only
/// [`SandboxError::Application`] leaves it usable.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("The {kind} crashed during {phase}")]
    Crashed {
        kind: PluginKind,
        phase: LifecyclePhase,
        context: String,
        stack_trace: Option<String>,
    },

    #[error("The {kind} did not answer in time during {phase}")]
    Timeout {
        kind: PluginKind,
        phase: LifecyclePhase,
        context: String,
    },

    #[error("Policy violation during {phase}: {violation}")]
    Policy {
        violation: PolicyViolation,
        phase: LifecyclePhase,
        context: String,
    },

    #[error("{code}: {details}")]
    Application { code: ErrorCode, details: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Sandbox creation failed: {0}")]
    Creation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SandboxError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::ChannelIo,
            Self::Channel(err) => err.code(),
            Self::Crashed { kind, .. } => kind.crash_code(),
            Self::Timeout { kind, .. } => match kind {
                PluginKind::Heuristics => ErrorCode::HeuristicTimeout,
                _ => ErrorCode::ChannelSlaveTimeout,
            },
            Self::Policy { violation, .. } => violation.code(),
            Self::Application { code, .. } => *code,
            Self::Protocol(_) => ErrorCode::ChannelProtocol,
            Self::Creation(_) => ErrorCode::SandboxCreation,
            Self::Config(_) => ErrorCode::Configuration,
            Self::Process(_) => ErrorCode::Fork,
            Self::Privilege(_) => ErrorCode::SandboxCreation,
            Self::InvalidState(_) => ErrorCode::InvalidState,
        }
    }

    /// Only application-level failures leave the session usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Application { .. })
    }

    /// Context string captured when the error happened, if any.
    pub fn context(&self) -> Option<&str> {
        match self {
            Self::Crashed { context, .. }
            | Self::Timeout { context, .. }
            | Self::Policy { context, .. } => Some(context.as_str()),
            _ => None,
        }
    }

    pub fn application(code: ErrorCode, details: impl Into<String>) -> Self {
        Self::Application {
            code,
            details: details.into(),
        }
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Wrap a foreign error with the operation that produced it.
pub fn to_sandbox_error(prefix: &str, err: impl fmt::Display) -> SandboxError {
    SandboxError::Process(format!("{prefix}: {err}"))
}

/// Response deadlines of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_creation_timeout_ms")]
    pub creation_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_ms: u64,
}

fn default_creation_timeout_ms() -> u64 {
    DEFAULT_CREATION_TIMEOUT_MS
}

fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

impl TimeoutConfig {
    pub fn creation(&self) -> Duration {
        Duration::from_millis(self.creation_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            creation_ms: DEFAULT_CREATION_TIMEOUT_MS,
            command_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

/// Bootstrap inputs of one sandbox session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxConfiguration {
    /// Trusted scripts (core-dump analyzer); readable while the Warden is armed
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
    /// Plugin source folders; readable while the Warden is armed
    #[serde(default)]
    pub source_dirs: Vec<PathBuf>,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Where the plugin's saved model and internal data end up
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Root of the chroot entered before construction (privileged runs only)
    #[serde(default)]
    pub jail_dir: Option<PathBuf>,
    /// Run-as identity of the sandboxed process (privileged runs only)
    #[serde(default)]
    pub username: Option<String>,
    /// Core file name with `$PID` placeholder, used to recover a stack trace
    #[serde(default)]
    pub core_dump_template: Option<String>,
    /// 0 (quiet) to 5 (packet dumps)
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default = "default_memory_budget")]
    pub memory_budget: u64,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub delete_log_files: bool,
    /// Let a privileged sandboxed process run without jail and run-as user
    #[serde(default)]
    pub allow_root: bool,
    /// Program re-executed as the sandboxed process in exec spawn mode
    #[serde(default = "default_sandbox_program")]
    pub sandbox_program: PathBuf,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("plugbox")
}

fn default_memory_budget() -> u64 {
    DEFAULT_MEMORY_BUDGET
}

fn default_sandbox_program() -> PathBuf {
    PathBuf::from("./plugbox")
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self {
            scripts_dir: None,
            source_dirs: Vec::new(),
            temp_dir: default_temp_dir(),
            log_dir: None,
            output_dir: None,
            jail_dir: None,
            username: None,
            core_dump_template: None,
            verbosity: 0,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            timeouts: TimeoutConfig::default(),
            delete_log_files: false,
            allow_root: false,
            sandbox_program: default_sandbox_program(),
        }
    }
}

impl SandboxConfiguration {
    /// Load a configuration from a JSON file; absent fields take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        let config: SandboxConfiguration = serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no session could run with.
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget == 0 {
            return Err(SandboxError::Config(
                "memory budget must be greater than zero".to_string(),
            ));
        }
        if self.timeouts.creation_ms == 0 || self.timeouts.command_ms == 0 {
            return Err(SandboxError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.verbosity > 5 {
            return Err(SandboxError::Config(format!(
                "verbosity {} out of range 0-5",
                self.verbosity
            )));
        }
        Ok(())
    }

    /// Folders the Warden lets the plugin open files from, besides the plugins folder.
    pub fn trusted_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::with_capacity(self.source_dirs.len() + 1);
        if let Some(scripts) = &self.scripts_dir {
            roots.push(scripts.clone());
        }
        roots.extend(self.source_dirs.iter().cloned());
        roots
    }

    /// SHA256 of the canonical JSON form; identifies the settings a session ran with.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
