//! Per-session text log, one file per sandbox session and side.
//!
//! Lines are timestamped; sent packets are marked `<`, received ones `>`.
//! Output stops at [`MAX_LOG_BYTES`] with a final truncation marker.
use crate::config::types::{Result, SandboxError};
use crate::protocol::MessageKind;
use chrono::Local;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub const MAX_LOG_BYTES: u64 = 200 * 1024;

pub const LEVEL_ERROR: u8 = 1;
pub const LEVEL_INFO: u8 = 2;
pub const LEVEL_DEBUG: u8 = 3;
pub const LEVEL_PACKETS: u8 = 4;

pub type SharedSessionLog = Rc<RefCell<SessionLog>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn marker(self) -> char {
        match self {
            Self::Sent => '<',
            Self::Received => '>',
        }
    }
}

/// `_YYYYmmdd-HHMMSS`, appended to log file names of one session.
pub fn session_suffix() -> String {
    Local::now().format("_%Y%m%d-%H%M%S").to_string()
}

#[derive(Debug)]
pub struct SessionLog {
    file: Option<File>,
    path: Option<PathBuf>,
    verbosity: u8,
    written: u64,
    truncated: bool,
}

impl SessionLog {
    /// Open `<dir>/<name><suffix>.log` for writing.
    pub fn open(dir: &Path, name: &str, suffix: &str, verbosity: u8) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            SandboxError::Config(format!("Failed to create log folder {}: {e}", dir.display()))
        })?;
        let path = dir.join(format!("{name}{suffix}.log"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SandboxError::Config(format!("Failed to open {}: {e}", path.display())))?;
        Ok(Self {
            file: Some(file),
            path: Some(path),
            verbosity,
            written: 0,
            truncated: false,
        })
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self {
            file: None,
            path: None,
            verbosity: 0,
            written: 0,
            truncated: false,
        }
    }

    pub fn shared(self) -> SharedSessionLog {
        Rc::new(RefCell::new(self))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    pub fn enabled(&self, level: u8) -> bool {
        self.file.is_some() && level <= self.verbosity
    }

    pub fn line(&mut self, level: u8, text: &str) {
        if !self.enabled(level) || self.truncated {
            return;
        }
        let stamp = Local::now().format("%H:%M:%S%.3f");
        let entry = format!("[{stamp}] {text}\n");
        self.write(entry.as_bytes());
    }

    pub fn error(&mut self, text: &str) {
        self.line(LEVEL_ERROR, &format!("ERROR: {text}"));
    }

    pub fn info(&mut self, text: &str) {
        self.line(LEVEL_INFO, text);
    }

    pub fn debug(&mut self, text: &str) {
        self.line(LEVEL_DEBUG, text);
    }

    pub fn packet(&mut self, direction: Direction, kind: MessageKind, payload_len: usize) {
        if !self.enabled(LEVEL_PACKETS) {
            return;
        }
        self.line(
            LEVEL_PACKETS,
            &format!("{} {kind} ({payload_len} bytes)", direction.marker()),
        );
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if self.written + bytes.len() as u64 > MAX_LOG_BYTES {
            let _ = file.write_all(b"... log truncated\n");
            self.truncated = true;
            return;
        }
        if file.write_all(bytes).is_ok() {
            self.written += bytes.len() as u64;
        }
    }
}

/// Contents of a log file, keeping only the last `max_size` bytes behind a `...` prefix.
pub fn read_log_tail(path: &Path, max_size: usize) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| SandboxError::Process(format!("Failed to open {}: {e}", path.display())))?;
    let len = file.metadata()?.len() as usize;

    let mut content = Vec::with_capacity(len.min(max_size));
    if len > max_size {
        file.seek(SeekFrom::Start((len - max_size) as u64))?;
    }
    file.read_to_end(&mut content)?;

    let text = String::from_utf8_lossy(&content).into_owned();
    if len > max_size {
        Ok(format!("...{text}"))
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_are_marked_by_direction() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::open(dir.path(), "ClassifierSandbox", "_test", 5).unwrap();
        log.packet(Direction::Sent, MessageKind::ClassifierTrain, 5);
        log.packet(Direction::Received, MessageKind::Response, 4);
        let path = log.path().unwrap().to_path_buf();
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(path.ends_with("ClassifierSandbox_test.log"));
        assert!(content.contains("< CLASSIFIER_TRAIN (5 bytes)"));
        assert!(content.contains("> RESPONSE (4 bytes)"));
    }

    #[test]
    fn verbosity_filters_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::open(dir.path(), "Quiet", "", LEVEL_INFO).unwrap();
        log.info("kept");
        log.debug("dropped");
        log.packet(Direction::Sent, MessageKind::Ping, 0);
        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(content.contains("kept"));
        assert!(!content.contains("dropped"));
        assert!(!content.contains("PING"));
    }

    #[test]
    fn output_stops_at_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::open(dir.path(), "Big", "", 5).unwrap();
        let chunk = "x".repeat(1000);
        for _ in 0..400 {
            log.info(&chunk);
        }
        let len = std::fs::metadata(log.path().unwrap()).unwrap().len();
        assert!(len <= MAX_LOG_BYTES + 64);
        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(content.ends_with("... log truncated\n"));
    }

    #[test]
    fn tail_is_prefixed_when_cut() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.log");
        std::fs::write(&path, "0123456789").unwrap();
        assert_eq!(read_log_tail(&path, 4).unwrap(), "...6789");
        assert_eq!(read_log_tail(&path, 40).unwrap(), "0123456789");
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let mut log = SessionLog::disabled();
        log.error("ignored");
        assert!(log.path().is_none());
        assert!(!log.enabled(LEVEL_ERROR));
    }

    #[test]
    fn suffix_has_timestamp_shape() {
        let suffix = session_suffix();
        assert_eq!(suffix.len(), "_20240101-120000".len());
        assert!(suffix.starts_with('_'));
    }
}
