use crate::config::types::{PluginKind, SandboxConfiguration, DEFAULT_MEMORY_BUDGET};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Everything the sandboxed process needs to know at start-up.
///
/// Built either from the command line of the `sandbox` subcommand, or
/// directly by the controller when it forks a host without re-executing.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub kind: PluginKind,
    pub read_fd: RawFd,
    pub write_fd: RawFd,
    pub username: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_suffix: String,
    pub output_dir: Option<PathBuf>,
    pub jail_dir: Option<PathBuf>,
    pub memory_budget: u64,
    pub verbosity: u8,
    /// Run with root privileges even without a jail and a run-as user
    pub allow_root: bool,
    /// Folders the plugin may open files from while the Warden is armed
    pub trusted_roots: Vec<PathBuf>,
}

impl HostOptions {
    pub fn new(kind: PluginKind, read_fd: RawFd, write_fd: RawFd) -> Self {
        Self {
            kind,
            read_fd,
            write_fd,
            username: None,
            log_dir: None,
            log_suffix: String::new(),
            output_dir: None,
            jail_dir: None,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            verbosity: 0,
            allow_root: false,
            trusted_roots: Vec::new(),
        }
    }

    /// Options of a host started by a controller using `config`.
    pub fn from_configuration(
        config: &SandboxConfiguration,
        kind: PluginKind,
        read_fd: RawFd,
        write_fd: RawFd,
        log_suffix: &str,
    ) -> Self {
        Self {
            username: config.username.clone(),
            log_dir: config.log_dir.clone(),
            log_suffix: log_suffix.to_string(),
            output_dir: config.output_dir.clone(),
            jail_dir: config.jail_dir.clone(),
            memory_budget: config.memory_budget,
            verbosity: config.verbosity,
            allow_root: config.allow_root,
            trusted_roots: config.trusted_roots(),
            ..Self::new(kind, read_fd, write_fd)
        }
    }

    /// Arguments of the `sandbox` subcommand reproducing these options.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "sandbox".to_string(),
            format!("--readfd={}", self.read_fd),
            format!("--writefd={}", self.write_fd),
            format!("--memory-budget={}", self.memory_budget),
        ];
        if let Some(user) = &self.username {
            args.push(format!("--username={user}"));
        }
        if let Some(dir) = &self.log_dir {
            args.push(format!("--logfolder={}", dir.display()));
        }
        if !self.log_suffix.is_empty() {
            args.push(format!("--logsuffix={}", self.log_suffix));
        }
        if let Some(dir) = &self.output_dir {
            args.push(format!("--outputfolder={}", dir.display()));
        }
        if let Some(dir) = &self.jail_dir {
            args.push(format!("--jailfolder={}", dir.display()));
        }
        for root in &self.trusted_roots {
            args.push(format!("--trusted-root={}", root.display()));
        }
        if self.allow_root {
            args.push("--allow-root".to_string());
        }
        if self.verbosity > 0 {
            args.push(format!("-{}", "v".repeat(self.verbosity as usize)));
        }
        args.push(self.kind.as_arg().to_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_fields_reach_the_host() {
        let config = SandboxConfiguration {
            scripts_dir: Some(PathBuf::from("/opt/scripts")),
            source_dirs: vec![PathBuf::from("/src/plugins")],
            username: Some("sandbox".to_string()),
            memory_budget: 64 << 20,
            verbosity: 3,
            ..SandboxConfiguration::default()
        };
        let options = HostOptions::from_configuration(&config, PluginKind::Classifier, 5, 8, "_x");
        assert_eq!(options.read_fd, 5);
        assert_eq!(options.write_fd, 8);
        assert_eq!(options.memory_budget, 64 << 20);
        assert_eq!(options.trusted_roots.len(), 2);
        assert!(!options.allow_root);
    }

    #[test]
    fn arguments_end_with_the_kind() {
        let mut options = HostOptions::new(PluginKind::GoalPlanner, 3, 4);
        options.verbosity = 2;
        options.jail_dir = Some(PathBuf::from("/var/jail"));
        let args = options.to_args();
        assert_eq!(args.first().map(String::as_str), Some("sandbox"));
        assert_eq!(args.last().map(String::as_str), Some("goalplanner"));
        assert!(args.contains(&"--jailfolder=/var/jail".to_string()));
        assert!(args.contains(&"-vv".to_string()));
    }
}
