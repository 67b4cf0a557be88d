//! Post-mortem material of a session: core-dump stack traces and log files.
use super::types::LogFile;
use crate::config::types::SandboxConfiguration;
use crate::observability::session_log::read_log_tail;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Script run against a core file to produce a stack trace.
pub const CORE_DUMP_ANALYZER: &str = "coredump_analyzer.py";

/// Smallest size a truncated log is cut to.
const MIN_LOG_SIZE: usize = 100;

/// Core file of `pid` per the configured template.
///
/// Relative names are resolved inside the jail once the process entered it.
pub fn core_dump_path(config: &SandboxConfiguration, pid: i32, jailed: bool) -> Option<PathBuf> {
    let template = config.core_dump_template.as_deref()?;
    let path = PathBuf::from(template.replace("$PID", &pid.to_string()));
    match (&config.jail_dir, jailed) {
        (Some(jail), true) if path.is_relative() => Some(jail.join(path)),
        _ => Some(path),
    }
}

/// Run the analyzer script on `core_file`. `None` when no trace could be produced.
pub fn analyze_core_dump(config: &SandboxConfiguration, core_file: &Path) -> Option<String> {
    let scripts = config.scripts_dir.as_deref()?;
    if !core_file.exists() {
        debug!("No core dump at {}", core_file.display());
        return None;
    }

    let output = Command::new(scripts.join(CORE_DUMP_ANALYZER))
        .arg(format!("--tempfolder={}", config.temp_dir.display()))
        .arg(core_file)
        .args(&config.source_dirs)
        .output();
    let output = match output {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to launch the core dump analyzer: {e}");
            return None;
        }
    };

    let trace = String::from_utf8_lossy(&output.stdout).into_owned();
    if trace.trim().is_empty() || trace.starts_with("ERROR -") {
        warn!("Failed to analyze the core dump {}", core_file.display());
        return None;
    }
    Some(trace)
}

/// Read `path` for a caller, keeping the last `max_size` bytes (0 = all).
pub fn read_log_file(name: &str, path: &Path, max_size: usize) -> Option<LogFile> {
    let max_size = match max_size {
        0 => usize::MAX,
        size => size.max(MIN_LOG_SIZE),
    };
    // Leave room for the "..." marker of a truncated log.
    match read_log_tail(path, max_size - 3) {
        Ok(content) if !content.is_empty() => Some(LogFile {
            name: name.to_string(),
            path: path.to_path_buf(),
            content,
        }),
        Ok(_) => None,
        Err(e) => {
            debug!("{e}");
            None
        }
    }
}
