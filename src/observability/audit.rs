/// Audit trail of sandbox lifecycle and policy events.
///
/// One JSON object per line, written to a process-wide audit file once
/// [`init_audit_logger`] has run; before that, events go to the `log` facade only.
use crate::config::types::{PluginKind, Result, SandboxError};
use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    SandboxCreated,
    SandboxCreationFailed,
    PluginLoaded,
    PluginsConstructed,
    PluginCrashed,
    CommandTimeout,
    MemoryLimitViolation,
    ForbiddenCallViolation,
    WardenFailure,
    SandboxClosed,
    ForcedKill,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            Self::MemoryLimitViolation | Self::ForbiddenCallViolation => AuditSeverity::Critical,
            Self::PluginCrashed | Self::WardenFailure | Self::SandboxCreationFailed => {
                AuditSeverity::High
            }
            Self::CommandTimeout | Self::ForcedKill => AuditSeverity::Medium,
            Self::SandboxCreated | Self::PluginLoaded | Self::PluginsConstructed | Self::SandboxClosed => {
                AuditSeverity::Low
            }
        }
    }
}

/// Identifies one sandbox session across all of its events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCorrelation {
    pub session_id: String,
    pub plugin_kind: PluginKind,
    pub sandbox_pid: Option<i32>,
}

impl SessionCorrelation {
    pub fn new(plugin_kind: PluginKind) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            plugin_kind,
            sandbox_pid: None,
        }
    }

    pub fn with_sandbox_pid(mut self, pid: i32) -> Self {
        self.sandbox_pid = Some(pid);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: String,
    pub details: String,
    pub correlation: Option<SessionCorrelation>,
    pub plugin: Option<String>,
    pub context: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, details: impl Into<String>) -> Self {
        Self {
            severity: event_type.default_severity(),
            event_type,
            timestamp: Utc::now().to_rfc3339(),
            details: details.into(),
            correlation: None,
            plugin: None,
            context: None,
        }
    }

    pub fn with_correlation(mut self, correlation: &SessionCorrelation) -> Self {
        self.correlation = Some(correlation.clone());
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        if !context.is_empty() {
            self.context = Some(context);
        }
        self
    }
}

pub struct AuditLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_path: Option<PathBuf>) -> Result<Self> {
        let audit_path = audit_path
            .unwrap_or_else(|| std::env::temp_dir().join("plugbox").join("audit.log"));

        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Config(format!("Failed to create audit log directory: {e}"))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| SandboxError::Config(format!("Failed to open audit log: {e}")))?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path,
        })
    }

    pub fn log_event(&self, event: &AuditEvent) {
        emit_to_log(event);

        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode audit event: {e}");
                return;
            }
        };
        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                    error!("Failed to write to audit log: {e}");
                }
            }
            Err(_) => error!("Failed to acquire lock on audit file"),
        }
    }

    pub fn audit_path(&self) -> &PathBuf {
        &self.audit_path
    }
}

fn emit_to_log(event: &AuditEvent) {
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => {
            error!("AUDIT {:?}: {}", event.event_type, event.details)
        }
        AuditSeverity::Medium => warn!("AUDIT {:?}: {}", event.event_type, event.details),
        AuditSeverity::Low => info!("AUDIT {:?}: {}", event.event_type, event.details),
    }
}

static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Open the process-wide audit file. A second call is ignored.
pub fn init_audit_logger(audit_path: Option<PathBuf>) -> Result<()> {
    let logger = AuditLogger::new(audit_path)?;
    if AUDIT_LOGGER.set(logger).is_err() {
        warn!("Audit logger already initialized");
    } else {
        info!("Audit logger initialized");
    }
    Ok(())
}

pub fn log_audit_event(event: AuditEvent) {
    match AUDIT_LOGGER.get() {
        Some(logger) => logger.log_event(&event),
        None => emit_to_log(&event),
    }
}

pub fn sandbox_created(correlation: &SessionCorrelation) {
    log_audit_event(
        AuditEvent::new(AuditEventType::SandboxCreated, "sandboxed process answered")
            .with_correlation(correlation),
    );
}

pub fn sandbox_creation_failed(correlation: &SessionCorrelation, reason: &str) {
    log_audit_event(
        AuditEvent::new(AuditEventType::SandboxCreationFailed, reason).with_correlation(correlation),
    );
}

pub fn plugin_loaded(correlation: &SessionCorrelation, plugin: &str, index: u32) {
    log_audit_event(
        AuditEvent::new(AuditEventType::PluginLoaded, format!("load index {index}"))
            .with_correlation(correlation)
            .with_plugin(plugin),
    );
}

pub fn plugins_constructed(correlation: &SessionCorrelation, count: usize) {
    log_audit_event(
        AuditEvent::new(AuditEventType::PluginsConstructed, format!("{count} plugin(s)"))
            .with_correlation(correlation),
    );
}

pub fn plugin_crashed(correlation: &SessionCorrelation, details: &str, context: &str) {
    log_audit_event(
        AuditEvent::new(AuditEventType::PluginCrashed, details)
            .with_correlation(correlation)
            .with_context(context),
    );
}

pub fn command_timeout(correlation: &SessionCorrelation, details: &str, context: &str) {
    log_audit_event(
        AuditEvent::new(AuditEventType::CommandTimeout, details)
            .with_correlation(correlation)
            .with_context(context),
    );
}

pub fn memory_limit_violation(correlation: &SessionCorrelation, peak: u64, budget: u64) {
    log_audit_event(
        AuditEvent::new(
            AuditEventType::MemoryLimitViolation,
            format!("peak {peak} bytes over budget {budget} bytes"),
        )
        .with_correlation(correlation),
    );
}

pub fn forbidden_call_violation(correlation: &SessionCorrelation, operation: &str) {
    log_audit_event(
        AuditEvent::new(AuditEventType::ForbiddenCallViolation, operation)
            .with_correlation(correlation),
    );
}

pub fn warden_failure(correlation: &SessionCorrelation, details: &str) {
    log_audit_event(
        AuditEvent::new(AuditEventType::WardenFailure, details).with_correlation(correlation),
    );
}

pub fn sandbox_closed(correlation: &SessionCorrelation) {
    log_audit_event(
        AuditEvent::new(AuditEventType::SandboxClosed, "terminated on request")
            .with_correlation(correlation),
    );
}

pub fn forced_kill(correlation: &SessionCorrelation, term_sent: bool, kill_sent: bool) {
    log_audit_event(
        AuditEvent::new(
            AuditEventType::ForcedKill,
            format!("SIGTERM sent: {term_sent}, SIGKILL sent: {kill_sent}"),
        )
        .with_correlation(correlation),
    );
}
