//! Sandboxed-process side of a session.
//!
//! [`SandboxHost`] answers the bootstrap handshake on the inherited channel
//! descriptors, then serves commands until told to terminate. Loading and
//! construction run with the Warden armed; the jail and the run-as identity
//! are applied right before construction, once every file the plugins will
//! need has been opened.

pub mod budget;
pub mod heuristics;
pub mod instruments;
pub mod options;
pub mod registry;
pub mod roles;

pub use heuristics::HeuristicsHost;
pub use instruments::InstrumentsHost;
pub use options::HostOptions;
pub use registry::{Constructor, DynamicLibrary, PluginDescriptor, PluginRegistry, DESCRIPTOR_SYMBOL};
pub use roles::{ChannelNotifier, ModelOutputs, RoleHost};

use crate::channel::{Channel, ChannelError, Endpoint};
use crate::config::types::{ErrorCode, PluginKind, Result, SandboxError};
use crate::kernel::credentials::{drop_to_identity, RunAsIdentity};
use crate::kernel::watchdog::{self, Stopwatch};
use crate::kernel::{jail, limits, signal};
use crate::observability::session_log::{SessionLog, SharedSessionLog};
use crate::plugin::{ModelData, PluginError, RolePlugin};
use crate::protocol::MessageKind;
use crate::rpc::remote::MASTER_GONE_EXIT_STATUS;
use budget::{ADDITIONAL_TIMEOUT, BUDGET_INITIALIZATION};
use crate::warden::{ArmedSection, ChannelViolationReporter, GuardedPhase, Warden};
use log::{debug, error, info, warn};
use nix::fcntl::{fcntl, FcntlArg};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path argument of `UseModel` meaning "no file".
pub const NO_FILE: &str = "-";

/// Why a host command did not produce its normal answer.
#[derive(Debug)]
pub enum CommandFailure {
    /// Reading the command or writing the answer failed
    Channel(ChannelError),
    /// The command ran and failed; the session goes on
    Plugin(PluginError),
}

impl From<ChannelError> for CommandFailure {
    fn from(err: ChannelError) -> Self {
        Self::Channel(err)
    }
}

impl From<PluginError> for CommandFailure {
    fn from(err: PluginError) -> Self {
        Self::Plugin(err)
    }
}

pub type CommandResult = std::result::Result<(), CommandFailure>;

fn check_descriptor(fd: RawFd, name: &str) -> Result<()> {
    if fd < 0 {
        return Err(SandboxError::Creation(format!("missing {name} descriptor")));
    }
    fcntl(fd, FcntlArg::F_GETFD)
        .map(|_| ())
        .map_err(|e| SandboxError::Creation(format!("invalid {name} descriptor {fd}: {e}")))
}

fn warden_missing() -> PluginError {
    PluginError::new(ErrorCode::Warden, "no Warden is installed in this process")
}

fn read_model_file(path: &str) -> Option<Vec<u8>> {
    if path.is_empty() || path == NO_FILE {
        return None;
    }
    match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to read model file {path}: {e}");
            None
        }
    }
}

pub struct SandboxHost {
    options: HostOptions,
    channel: Channel,
    log: SharedSessionLog,
    registry: PluginRegistry,
    identity: Option<RunAsIdentity>,
    plugins_folder: Option<PathBuf>,
    loaded: Vec<PluginDescriptor>,
    libraries: Vec<DynamicLibrary>,
    model: ModelData,
    role: Option<RoleHost>,
}

impl SandboxHost {
    /// Open the channel, lock in the process attributes, install the Warden
    /// and answer the creation handshake.
    pub fn init(options: HostOptions, registry: PluginRegistry) -> Result<Self> {
        check_descriptor(options.read_fd, "read")?;
        check_descriptor(options.write_fd, "write")?;

        let mut channel = Channel::from_fds(options.read_fd, options.write_fd, Endpoint::Slave);
        let log = open_session_log(&options);
        channel.attach_log(log.clone());

        let identity = match prepare_process(&options) {
            Ok(identity) => identity,
            Err(err) => {
                error!("Sandbox creation failed: {err}");
                log.borrow_mut().error(&format!("ERROR: {err}"));
                let _ = channel.send_empty(MessageKind::CreationFailed);
                return Err(err);
            }
        };

        channel.send_empty(MessageKind::CreationSuccessful)?;
        log.borrow_mut().info(&format!("{} sandbox ready", options.kind));

        Ok(Self {
            options,
            channel,
            log,
            registry,
            identity,
            plugins_folder: None,
            loaded: Vec::new(),
            libraries: Vec::new(),
            model: ModelData::default(),
            role: None,
        })
    }

    pub fn kind(&self) -> PluginKind {
        self.options.kind
    }

    /// Serve commands until `Terminate`. Returns an error when the channel fails.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let kind = match self.channel.receive_packet(None) {
                Ok(kind) => kind,
                Err(err) => {
                    self.log.borrow_mut().error(&format!("ERROR: {err}"));
                    return Err(err.into());
                }
            };

            let result = match kind {
                MessageKind::Terminate => {
                    self.log.borrow_mut().info("> TERMINATE");
                    self.channel.send_empty(MessageKind::Response)?;
                    return Ok(());
                }
                MessageKind::Ping => {
                    self.channel.send_empty(MessageKind::Pong)?;
                    continue;
                }
                MessageKind::SetPluginsFolder => self.set_plugins_folder(),
                MessageKind::LoadPlugin => self.load_plugin(),
                MessageKind::UseModel => self.use_model(),
                MessageKind::CreatePlugins => self.create_plugins(),
                other => {
                    let handled = match self.role.as_mut() {
                        Some(role) => role.handle(other, &mut self.channel),
                        None => None,
                    };
                    match handled {
                        Some(result) => result,
                        None => {
                            self.log
                                .borrow_mut()
                                .error(&format!("ERROR: unknown command {other}"));
                            self.channel.send_empty(MessageKind::UnknownCommand)?;
                            continue;
                        }
                    }
                }
            };

            if let Err(failure) = result {
                self.report_failure(kind, failure)?;
            }
        }
    }

    fn report_failure(&mut self, kind: MessageKind, failure: CommandFailure) -> Result<()> {
        let err = match failure {
            CommandFailure::Plugin(err) => err,
            CommandFailure::Channel(err) if err.is_fatal() => {
                self.log.borrow_mut().error(&format!("ERROR: {err}"));
                return Err(err.into());
            }
            CommandFailure::Channel(err) => PluginError::new(err.code(), err.to_string()),
        };

        self.log
            .borrow_mut()
            .error(&format!("ERROR: {kind} failed: {err}"));
        let writer = self.channel.start_packet(MessageKind::Error);
        writer.add(&err.code.as_u32());
        if err.code == ErrorCode::Warden {
            writer.add(&err.message);
        }
        self.channel.send_packet()?;
        Ok(())
    }

    fn set_plugins_folder(&mut self) -> CommandResult {
        let folder = PathBuf::from(self.channel.read::<String>()?);
        self.log
            .borrow_mut()
            .info(&format!("> SET_PLUGINS_FOLDER {}", folder.display()));

        let warden = Warden::get().ok_or_else(warden_missing)?;
        warden.add_allowed_root(folder.clone());
        self.plugins_folder = Some(folder);
        self.channel.send_empty(MessageKind::Response)?;
        Ok(())
    }

    fn load_plugin(&mut self) -> CommandResult {
        let name = self.channel.read::<String>()?;
        self.log.borrow_mut().info(&format!("> LOAD_PLUGIN {name}"));

        if self.role.is_some() {
            return Err(PluginError::new(
                ErrorCode::InvalidState,
                "plugins are already constructed",
            )
            .into());
        }
        if !self.options.kind.allows_many() && !self.loaded.is_empty() {
            return Err(PluginError::new(
                ErrorCode::PluginLoadingFailed,
                format!("a {} sandbox hosts a single plugin", self.options.kind),
            )
            .into());
        }
        if Warden::get().is_none() {
            return Err(warden_missing().into());
        }

        let descriptor = {
            let _armed = ArmedSection::enter(GuardedPhase::Loading);
            self.resolve(&name)?
        };

        if descriptor.kind != self.options.kind {
            return Err(PluginError::new(
                ErrorCode::PluginKindMismatch,
                format!("{name} is a {}, not a {}", descriptor.kind, self.options.kind),
            )
            .into());
        }

        let index = self.loaded.len() as u32;
        self.loaded.push(descriptor);
        info!("Loaded plugin {name} as #{index}");
        self.channel.start_packet(MessageKind::Response).add(&index);
        self.channel.send_packet()?;
        Ok(())
    }

    /// Find `name` and run its load hook. Called with the Warden armed.
    fn resolve(&mut self, name: &str) -> std::result::Result<PluginDescriptor, PluginError> {
        if let Some(descriptor) = self.registry.find(name).copied() {
            if let Some(hook) = descriptor.on_load {
                hook();
            }
            return Ok(descriptor);
        }

        let folder = self
            .plugins_folder
            .as_deref()
            .ok_or_else(|| PluginError::from_code(ErrorCode::PluginsFolderNotSet))?;
        let (library, descriptor) = registry::open_library(&registry::library_path(folder, name))?;
        debug!("Mapped {}", library.path().display());
        self.libraries.push(library);
        if let Some(hook) = descriptor.on_load {
            hook();
        }
        Ok(descriptor)
    }

    fn use_model(&mut self) -> CommandResult {
        let model_path = self.channel.read::<String>()?;
        let data_path = self.channel.read::<String>()?;
        self.log
            .borrow_mut()
            .info(&format!("> USE_MODEL {model_path} {data_path}"));

        let model = read_model_file(&model_path);
        let internal_data = match model {
            Some(_) => read_model_file(&data_path),
            None => None,
        };
        self.model = ModelData {
            model,
            internal_data,
        };
        self.channel.send_empty(MessageKind::Response)?;
        Ok(())
    }

    fn create_plugins(&mut self) -> CommandResult {
        self.log.borrow_mut().info("> CREATE_PLUGINS");
        if self.loaded.is_empty() {
            return Err(PluginError::from_code(ErrorCode::NoPluginLoaded).into());
        }
        if self.role.is_some() {
            return Err(PluginError::new(
                ErrorCode::InvalidState,
                "plugins are already constructed",
            )
            .into());
        }
        if Warden::get().is_none() {
            return Err(warden_missing().into());
        }

        let outputs = self.open_outputs();
        self.lock_down()
            .map_err(|e| PluginError::new(e.code(), e.to_string()))?;

        self.channel.send_empty(MessageKind::KeepAlive)?;
        let (plugins, timings) = self.construct_all()?;

        let model = std::mem::take(&mut self.model);
        let mut role = RoleHost::assemble(self.options.kind, plugins, model, outputs, &self.channel)?;
        if let RoleHost::Heuristics(host) = &mut role {
            host.charge_construction(&timings)?;
        }
        info!("Constructed {} plugin(s)", role.len());
        self.role = Some(role);
        self.channel.send_empty(MessageKind::Response)?;
        Ok(())
    }

    /// Run every constructor with the Warden armed and naming the plugin.
    ///
    /// In multi-plugin sandboxes the trusted side is told which plugin is
    /// being constructed. Heuristic constructors run on a stopwatch; the
    /// processor time each one used comes back alongside the plugins.
    fn construct_all(&mut self) -> std::result::Result<(Vec<RolePlugin>, Vec<Duration>), CommandFailure> {
        let kind = self.options.kind;
        let notice = match kind {
            PluginKind::Heuristics => Some(MessageKind::CurrentHeuristic),
            PluginKind::Instruments => Some(MessageKind::CurrentInstrument),
            PluginKind::Classifier | PluginKind::GoalPlanner => None,
        };
        let warden = Warden::get().ok_or_else(warden_missing)?;

        let mut plugins = Vec::with_capacity(self.loaded.len());
        let mut timings = Vec::with_capacity(self.loaded.len());
        for (index, descriptor) in self.loaded.iter().enumerate() {
            let index = index as u32;
            if let Some(notice) = notice {
                self.channel.start_packet(notice).add(&index);
                self.channel.send_packet()?;
            }
            debug!("Constructing {} as #{index}", descriptor.name);

            warden.set_subject(Some(index));
            let watch = Stopwatch::start(match kind {
                PluginKind::Heuristics => BUDGET_INITIALIZATION + ADDITIONAL_TIMEOUT,
                _ => Duration::ZERO,
            });
            let constructed = {
                let _armed = ArmedSection::enter(GuardedPhase::Construction);
                (descriptor.construct)(&self.model)
            };
            timings.push(watch.stop());
            warden.set_subject(None);

            plugins.push(constructed?);
            self.channel.send_empty(MessageKind::KeepAlive)?;
        }
        Ok((plugins, timings))
    }

    fn open_outputs(&self) -> Option<ModelOutputs> {
        if !self.options.kind.is_predictor() {
            return None;
        }
        let dir = self.options.output_dir.as_deref()?;
        match ModelOutputs::create(dir) {
            Ok(outputs) => Some(outputs),
            Err(e) => {
                warn!("Failed to open model outputs in {}: {e}", dir.display());
                None
            }
        }
    }

    /// Jail, descriptor and process limits, run-as identity. Root only.
    fn lock_down(&self) -> Result<()> {
        if !limits::running_as_root() {
            debug!("Not privileged: no jail, limits or identity change");
            return Ok(());
        }
        let Some(jail_dir) = self.options.jail_dir.as_deref() else {
            warn!("Running as root without a jail folder");
            return Ok(());
        };

        jail::enter_jail(jail_dir)?;
        limits::forbid_new_files_and_processes()?;
        match &self.identity {
            Some(identity) => drop_to_identity(identity)?,
            None => warn!("Running as root inside the jail: no run-as user"),
        }
        Ok(())
    }
}

fn open_session_log(options: &HostOptions) -> SharedSessionLog {
    let Some(dir) = options.log_dir.as_deref() else {
        return SessionLog::disabled().shared();
    };
    match SessionLog::open(dir, options.kind.log_name(), &options.log_suffix, options.verbosity) {
        Ok(log) => log.shared(),
        Err(e) => {
            warn!("Session log unavailable: {e}");
            SessionLog::disabled().shared()
        }
    }
}

/// Everything `init` does before the handshake; returns the run-as identity.
fn prepare_process(options: &HostOptions) -> Result<Option<RunAsIdentity>> {
    signal::ignore_sigpipe();
    signal::restore_crash_signals();
    if let Err(e) = limits::raise_core_limit() {
        warn!("{e}");
    }
    if let Err(e) = limits::mark_dumpable() {
        warn!("{e}");
    }

    let mut identity = None;
    if limits::running_as_root() {
        match (&options.jail_dir, &options.username) {
            (Some(jail_dir), Some(username)) => {
                identity = Some(RunAsIdentity::lookup(username)?);
                create_jail_folder(jail_dir)?;
            }
            _ if options.allow_root => {
                warn!("Running as root without jail folder and run-as user");
            }
            _ => {
                return Err(SandboxError::Creation(
                    "running as root requires a jail folder and a username".to_string(),
                ))
            }
        }
    }

    if options.kind == PluginKind::Heuristics {
        watchdog::install(options.write_fd, ErrorCode::HeuristicTimeout)
            .map_err(|e| SandboxError::Creation(format!("Failed to install the watchdog: {e}")))?;
    }

    let reporter = ChannelViolationReporter::new(options.write_fd);
    Warden::install(
        options.memory_budget,
        options.trusted_roots.clone(),
        Box::new(reporter),
    )?;
    Ok(identity)
}

fn create_jail_folder(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        SandboxError::Creation(format!("Failed to create jail folder {}: {e}", dir.display()))
    })
}

/// Body of a sandboxed process; returns its exit status.
pub fn run_host(options: HostOptions, registry: PluginRegistry) -> i32 {
    let mut host = match SandboxHost::init(options, registry) {
        Ok(host) => host,
        Err(err) => {
            error!("{err}");
            return 1;
        }
    };

    match host.run() {
        Ok(()) => 0,
        Err(SandboxError::Channel(ChannelError::MasterGone)) => {
            info!("Trusted process went away");
            MASTER_GONE_EXIT_STATUS
        }
        Err(err) => {
            error!("{} sandbox stopped: {err}", host.kind());
            1
        }
    }
}
