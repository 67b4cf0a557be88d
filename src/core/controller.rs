//! Trusted-side driver of one sandbox session.
use super::diagnostics;
use super::spawn::spawn_sandbox;
use super::types::{ControllerState, LogFile, SpawnMode, TrainingListener};
use crate::channel::{Channel, ChannelError};
use crate::config::types::{
    ErrorCode, LifecyclePhase, PluginKind, PolicyViolation, Result, SandboxConfiguration,
    SandboxError,
};
use crate::kernel::limits;
use crate::kernel::process::{self, ChildExit};
use crate::observability::audit::{self, SessionCorrelation};
use crate::observability::session_log::{self, SessionLog, SharedSessionLog};
use crate::protocol::{Decode, MessageKind, PacketWriter};
use crate::rpc::{DispatchOutcome, ReverseCall, ReverseCallTable};
use log::{debug, info, warn};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the controller's own session log.
const CONTROLLER_LOG_NAME: &str = "SandboxController";

/// Plugin index meaning "no plugin" in violation reports.
const NO_SUBJECT: u32 = u32::MAX;

/// How long a crashed child gets to finish dying before it is reaped.
const REAP_GRACE: Duration = Duration::from_millis(500);

/// Drives one sandboxed process through its life cycle.
///
/// Every failure of categories transport, crash, timeout and policy moves
/// the controller to a terminal state; later calls fail fast with
/// [`SandboxError::InvalidState`].
pub struct SandboxController {
    kind: PluginKind,
    config: SandboxConfiguration,
    state: ControllerState,
    pid: Option<Pid>,
    channel: Option<Channel>,
    log: SharedSessionLog,
    log_suffix: String,
    correlation: SessionCorrelation,
    plugins: Vec<String>,
    jailed: bool,
    context: String,
    /// Plugin named by the sandbox while the current command runs
    culprit: Option<u32>,
    training_listener: Option<Box<dyn TrainingListener>>,
    last_error: ErrorCode,
    last_error_details: String,
    exit: Option<ChildExit>,
}

impl SandboxController {
    pub fn new(kind: PluginKind, config: SandboxConfiguration) -> Self {
        let log_suffix = session_log::session_suffix();
        let log = match &config.log_dir {
            Some(dir) => match SessionLog::open(dir, CONTROLLER_LOG_NAME, &log_suffix, config.verbosity) {
                Ok(log) => log,
                Err(e) => {
                    warn!("Controller log unavailable: {e}");
                    SessionLog::disabled()
                }
            },
            None => SessionLog::disabled(),
        };

        Self {
            kind,
            config,
            state: ControllerState::Unborn,
            pid: None,
            channel: None,
            log: log.shared(),
            log_suffix,
            correlation: SessionCorrelation::new(kind),
            plugins: Vec::new(),
            jailed: false,
            context: String::new(),
            culprit: None,
            training_listener: None,
            last_error: ErrorCode::None,
            last_error_details: String::new(),
            exit: None,
        }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn configuration(&self) -> &SandboxConfiguration {
        &self.config
    }

    pub fn sandbox_pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    /// How the sandboxed process ended, once it was reaped.
    pub fn exit_status(&self) -> Option<ChildExit> {
        self.exit
    }

    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Details sent along with the last error, when there were any.
    pub fn last_error_details(&self) -> &str {
        &self.last_error_details
    }

    /// Description of the operation in flight, for post-crash diagnostics.
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn set_context(&mut self, context: impl Into<String>) {
        self.context = context.into();
    }

    /// Index of the plugin the sandbox reported as running, during the
    /// current command or the one that failed.
    pub fn culprit(&self) -> Option<u32> {
        self.culprit
    }

    /// Receive the training progress a predictor reports while a command runs.
    pub fn set_training_listener(&mut self, listener: impl TrainingListener + 'static) {
        self.training_listener = Some(Box::new(listener));
    }

    /// The context, plus the plugin the sandbox named last.
    fn failure_context(&self) -> String {
        let Some(index) = self.culprit else {
            return self.context.clone();
        };
        let role = match self.kind {
            PluginKind::Instruments => "instrument",
            _ => "heuristic",
        };
        let name = self.plugins.get(index as usize).map_or("?", String::as_str);
        let mut context = self.context.clone();
        if !context.is_empty() && !context.ends_with('\n') {
            context.push('\n');
        }
        context.push_str(&format!("Current {role}: #{index} ({name})\n"));
        context
    }

    /// Start the sandboxed process and wait for its creation handshake.
    pub fn create_sandbox(&mut self, mode: SpawnMode) -> Result<()> {
        if self.state != ControllerState::Unborn {
            return Err(SandboxError::InvalidState(format!(
                "sandbox already created (state {:?})",
                self.state
            )));
        }
        self.info("Creation of the sandbox");

        let (pid, mut channel) = match spawn_sandbox(&mode, &self.config, self.kind, &self.log_suffix) {
            Ok(spawned) => spawned,
            Err(err) => {
                audit::sandbox_creation_failed(&self.correlation, &err.to_string());
                return Err(self.record(err));
            }
        };
        if self.config.verbosity >= session_log::LEVEL_PACKETS {
            channel.attach_log(self.log.clone());
        }
        self.pid = Some(pid);
        self.correlation = SessionCorrelation::new(self.kind).with_sandbox_pid(pid.as_raw());
        self.channel = Some(channel);
        self.state = ControllerState::ChannelReady;

        let timeout = self.config.timeouts.creation();
        let status = self.channel_mut()?.receive_packet(Some(timeout));
        match status {
            Ok(MessageKind::CreationSuccessful) => {
                info!("{} sandbox {} ready", self.kind, pid);
                audit::sandbox_created(&self.correlation);
                Ok(())
            }
            Ok(other) => {
                let err = SandboxError::Creation(format!("sandbox answered {other}"));
                audit::sandbox_creation_failed(&self.correlation, &err.to_string());
                self.abandon();
                Err(self.record(err))
            }
            Err(err) => {
                let err = SandboxError::Creation(err.to_string());
                audit::sandbox_creation_failed(&self.correlation, &err.to_string());
                self.abandon();
                Err(self.record(err))
            }
        }
    }

    /// Folder plugin libraries are loaded from; the Warden lets loading read it.
    pub fn set_plugins_folder(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_state(&[ControllerState::ChannelReady, ControllerState::Loaded])?;
        let path = path.into();
        self.info(&format!("< SET_PLUGINS_FOLDER {}", path.display()));
        let folder = path.to_string_lossy().into_owned();
        self.command(
            MessageKind::SetPluginsFolder,
            |writer| {
                writer.add(&folder);
            },
            LifecyclePhase::Loading,
        )
    }

    /// Load one plugin; returns its index in this session.
    pub fn load_plugin(&mut self, name: &str) -> Result<u32> {
        self.ensure_state(&[ControllerState::ChannelReady, ControllerState::Loaded])?;
        self.info(&format!("< LOAD_PLUGIN {name}"));
        self.command(
            MessageKind::LoadPlugin,
            |writer| {
                writer.add(name);
            },
            LifecyclePhase::Loading,
        )?;

        let index = self.read::<u32>()?;
        self.plugins.push(name.to_string());
        self.state = ControllerState::Loaded;
        audit::plugin_loaded(&self.correlation, name, index);
        Ok(index)
    }

    /// Model files handed to predictor plugins at construction. `None` = no file.
    pub fn use_model(&mut self, model: Option<PathBuf>, internal_data: Option<PathBuf>) -> Result<()> {
        self.ensure_state(&[ControllerState::ChannelReady, ControllerState::Loaded])?;
        let as_arg = |path: Option<PathBuf>| match path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => crate::host::NO_FILE.to_string(),
        };
        let model = as_arg(model);
        let internal_data = as_arg(internal_data);
        self.info(&format!("< USE_MODEL {model} {internal_data}"));
        self.command(
            MessageKind::UseModel,
            |writer| {
                writer.add(&model).add(&internal_data);
            },
            LifecyclePhase::Loading,
        )
    }

    /// Construct every loaded plugin inside the locked-down process.
    pub fn create_plugins(&mut self) -> Result<()> {
        self.ensure_state(&[ControllerState::Loaded])?;
        self.info("< CREATE_PLUGINS");
        self.jailed = self.config.jail_dir.is_some() && limits::running_as_root();
        self.command(MessageKind::CreatePlugins, |_| {}, LifecyclePhase::Construction)?;
        self.state = ControllerState::Ready;
        audit::plugins_constructed(&self.correlation, self.plugins.len());
        Ok(())
    }

    /// Index of a loaded plugin.
    pub fn plugin_index(&self, name: &str) -> Option<u32> {
        self.plugins
            .iter()
            .position(|plugin| plugin == name)
            .map(|index| index as u32)
    }

    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Send a steady-state command and wait for its terminal answer,
    /// answering reverse calls through `table` meanwhile.
    ///
    /// On success the answer's fields are read with [`read`](Self::read) and
    /// friends.
    pub fn request(
        &mut self,
        kind: MessageKind,
        build: impl FnOnce(&mut PacketWriter),
        table: &mut ReverseCallTable<'_>,
    ) -> Result<()> {
        self.ensure_state(&[ControllerState::Ready])?;
        self.debug(&format!("< {kind}"));
        self.send(kind, build, LifecyclePhase::Command)?;
        self.wait_response(self.config.timeouts.command(), table, LifecyclePhase::Command)
    }

    /// Round trip with the sandboxed process.
    ///
    /// After a timeout this confirms the process is gone; it never revives
    /// the session.
    pub fn ping(&mut self) -> Result<()> {
        let channel = self.channel_mut()?;
        if let Some(err) = channel.last_error() {
            return Err(SandboxError::Channel(err));
        }
        let sent = channel.send_empty(MessageKind::Ping);
        sent.map_err(|err| self.channel_failure(err, LifecyclePhase::Command))?;
        let timeout = self.config.timeouts.command();
        let received = self.channel_mut()?.receive_packet(Some(timeout));
        match received.map_err(|err| self.channel_failure(err, LifecyclePhase::Command))? {
            MessageKind::Pong => Ok(()),
            other => {
                let err = SandboxError::Protocol(format!("{other} received instead of PONG"));
                Err(self.fail(ControllerState::Crashed, err))
            }
        }
    }

    /// Ask the sandboxed process to terminate, wait for it and reap it.
    pub fn close_sandbox(&mut self) -> Result<()> {
        let Some(pid) = self.pid else {
            self.state = ControllerState::Closed;
            return Ok(());
        };
        if let Some(core) = diagnostics::core_dump_path(&self.config, pid.as_raw(), self.jailed) {
            let _ = std::fs::remove_file(core);
        }

        let mut result = Ok(());
        if !self.state.is_terminal() {
            self.info("< TERMINATE");
            result = self
                .send(MessageKind::Terminate, |_| {}, LifecyclePhase::Command)
                .and_then(|()| {
                    self.wait_response(
                        self.config.timeouts.command(),
                        &mut ReverseCallTable::None,
                        LifecyclePhase::Command,
                    )
                });
        }

        if self.exit.is_none() {
            self.exit = match process::wait_for_exit(pid, REAP_GRACE) {
                Ok(Some(exit)) => Some(exit),
                _ => {
                    let report = process::terminate(pid);
                    audit::forced_kill(&self.correlation, report.term_sent, report.kill_sent);
                    report.exit
                }
            };
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.channel = None;
        self.state = ControllerState::Closed;
        audit::sandbox_closed(&self.correlation);
        result
    }

    /// Stack trace of the crashed sandboxed process, from its core file.
    pub fn stack_trace(&self) -> Option<String> {
        let pid = self.pid?;
        let core = diagnostics::core_dump_path(&self.config, pid.as_raw(), self.jailed)?;
        diagnostics::analyze_core_dump(&self.config, &core)
    }

    /// Controller and sandbox logs of this session, each cut to `max_size` bytes (0 = all).
    pub fn log_files(&self, max_size: usize) -> Vec<LogFile> {
        let mut files = Vec::with_capacity(2);
        if let Some(path) = self.log.borrow().path() {
            files.extend(diagnostics::read_log_file(CONTROLLER_LOG_NAME, path, max_size));
        }
        if let Some(path) = self.sandbox_log_path() {
            files.extend(diagnostics::read_log_file(self.kind.log_name(), &path, max_size));
        }
        files
    }

    fn sandbox_log_path(&self) -> Option<PathBuf> {
        let dir = self.config.log_dir.as_ref()?;
        Some(dir.join(format!("{}{}.log", self.kind.log_name(), self.log_suffix)))
    }

    /// Read one field of the last answer.
    pub fn read<T: Decode>(&mut self) -> Result<T> {
        let value = self.channel_mut()?.read::<T>();
        value.map_err(|err| self.protocol_failure(err))
    }

    pub fn read_f32_block(&mut self, count: usize) -> Result<Vec<f32>> {
        let values = self.channel_mut()?.read_f32_block(count);
        values.map_err(|err| self.protocol_failure(err))
    }

    /// Whether every field of the last answer was read.
    pub fn is_at_end(&self) -> bool {
        self.channel.as_ref().map_or(true, Channel::is_at_end)
    }

    /// Decode a multi-field part of the last answer.
    pub fn read_with<T>(
        &mut self,
        decode: impl FnOnce(&mut Channel) -> std::result::Result<T, ChannelError>,
    ) -> Result<T> {
        let value = decode(self.channel_mut()?);
        value.map_err(|err| self.protocol_failure(err))
    }

    fn command(
        &mut self,
        kind: MessageKind,
        build: impl FnOnce(&mut PacketWriter),
        phase: LifecyclePhase,
    ) -> Result<()> {
        self.send(kind, build, phase)?;
        self.wait_response(self.config.timeouts.command(), &mut ReverseCallTable::None, phase)
    }

    fn send(
        &mut self,
        kind: MessageKind,
        build: impl FnOnce(&mut PacketWriter),
        phase: LifecyclePhase,
    ) -> Result<()> {
        self.culprit = None;
        let channel = self.channel_mut()?;
        build(channel.start_packet(kind));
        let sent = channel.send_packet();
        sent.map_err(|err| self.channel_failure(err, phase))
    }

    /// Receive until the terminal answer of the command in flight.
    fn wait_response(
        &mut self,
        timeout: Duration,
        table: &mut ReverseCallTable<'_>,
        phase: LifecyclePhase,
    ) -> Result<()> {
        loop {
            let received = self.channel_mut()?.receive_packet(Some(timeout));
            let kind = received.map_err(|err| self.channel_failure(err, phase))?;

            match kind {
                MessageKind::KeepAlive => continue,
                MessageKind::Response | MessageKind::Pong => return Ok(()),
                MessageKind::Error => return Err(self.error_packet(phase)),
                MessageKind::CurrentHeuristic | MessageKind::CurrentInstrument => {
                    let index = self.read::<u32>()?;
                    self.debug(&format!("> {kind} {index}"));
                    self.culprit = Some(index);
                }
                MessageKind::TrainingStepDone => {
                    let step = self.read::<u32>()?;
                    let nb_steps = self.read::<u32>()?;
                    if let Some(listener) = self.training_listener.as_mut() {
                        listener.training_step_done(step, nb_steps);
                    }
                }
                MessageKind::MemoryLimitReached => {
                    let peak = self.read::<u64>()?;
                    let budget = self.read::<u64>()?;
                    self.read_subject()?;
                    audit::memory_limit_violation(&self.correlation, peak, budget);
                    return Err(self.policy_failure(PolicyViolation::MemoryLimit { peak, budget }, phase));
                }
                MessageKind::ForbiddenSystemCall => {
                    let operation = self.read::<String>()?;
                    self.read_subject()?;
                    audit::forbidden_call_violation(&self.correlation, &operation);
                    self.last_error_details = operation.clone();
                    return Err(self.policy_failure(PolicyViolation::ForbiddenCall { operation }, phase));
                }
                MessageKind::UnknownCommand => {
                    let err = SandboxError::Protocol("command unknown to the sandbox".to_string());
                    return Err(self.fail(ControllerState::Crashed, err));
                }
                other if other.is_reverse_call() => self.answer_reverse_call(other, table, phase)?,
                other => {
                    let err = SandboxError::Protocol(format!("unexpected {other} while waiting for an answer"));
                    return Err(self.fail(ControllerState::Crashed, err));
                }
            }
        }
    }

    /// Trailing plugin index of a violation report.
    fn read_subject(&mut self) -> Result<()> {
        match self.read::<u32>()? {
            NO_SUBJECT => {}
            index => self.culprit = Some(index),
        }
        Ok(())
    }

    fn answer_reverse_call(
        &mut self,
        kind: MessageKind,
        table: &mut ReverseCallTable<'_>,
        phase: LifecyclePhase,
    ) -> Result<()> {
        let channel = self.channel_mut()?;
        let call = match ReverseCall::read(kind, channel) {
            Ok(Some(call)) => call,
            Ok(None) => {
                let err = SandboxError::Protocol(format!("{kind} is not a reverse call"));
                return Err(self.fail(ControllerState::Crashed, err));
            }
            Err(err) => return Err(self.protocol_failure(err)),
        };

        self.debug(&format!("> {kind}"));
        let channel = self.channel_mut()?;
        match table.dispatch(&call, channel) {
            Ok(DispatchOutcome::Processed) => Ok(()),
            Ok(DispatchOutcome::ApplicationFailure(err)) => {
                debug!("{kind} answered with {}", err.code);
                self.info(&format!("< ERROR {} ({kind})", err.code));
                Ok(())
            }
            Ok(DispatchOutcome::NoTarget) => {
                let err = SandboxError::Protocol(format!("no handler bound for {kind}"));
                Err(self.fail(ControllerState::Crashed, err))
            }
            Err(err) => Err(self.channel_failure(err, phase)),
        }
    }

    /// Decode an `Error` packet. Codes outside the recoverable set end the session.
    fn error_packet(&mut self, phase: LifecyclePhase) -> SandboxError {
        let code = match self.read::<u32>() {
            Ok(value) => ErrorCode::from_u32(value).unwrap_or(ErrorCode::ChannelProtocol),
            Err(err) => return err,
        };
        if code == ErrorCode::Warden {
            let details = self.read::<String>().unwrap_or_default();
            self.info(&format!("> ERROR {details}"));
            audit::warden_failure(&self.correlation, &details);
            self.last_error_details = details.clone();
            return self.policy_failure(PolicyViolation::Warden { details }, phase);
        }

        self.info(&format!("> ERROR {}", code.description()));
        if code.is_recoverable() {
            return self.record(SandboxError::application(code, code.description()));
        }
        if code == ErrorCode::HeuristicTimeout {
            self.reap_quietly();
            audit::command_timeout(&self.correlation, code.description(), &self.failure_context());
            let err = SandboxError::Timeout {
                kind: self.kind,
                phase,
                context: self.failure_context(),
            };
            return self.fail(ControllerState::TimedOut, err);
        }
        let err = SandboxError::Protocol(format!("sandbox reported {code}"));
        self.fail(ControllerState::Crashed, err)
    }

    fn policy_failure(&mut self, violation: PolicyViolation, phase: LifecyclePhase) -> SandboxError {
        self.reap_quietly();
        let err = SandboxError::Policy {
            violation,
            phase,
            context: self.failure_context(),
        };
        self.fail(ControllerState::Crashed, err)
    }

    /// Map a channel failure onto the session's error vocabulary.
    fn channel_failure(&mut self, err: ChannelError, phase: LifecyclePhase) -> SandboxError {
        match err {
            ChannelError::SlaveTimeout(_) => {
                audit::command_timeout(&self.correlation, &err.to_string(), &self.failure_context());
                let err = SandboxError::Timeout {
                    kind: self.kind,
                    phase,
                    context: self.failure_context(),
                };
                self.fail(ControllerState::TimedOut, err)
            }
            ChannelError::Packet(_) | ChannelError::NoPacket => self.protocol_failure(err),
            ChannelError::SlaveCrashed
            | ChannelError::MasterGone
            | ChannelError::Io(_)
            | ChannelError::Closed => {
                self.reap_quietly();
                let stack_trace = self.stack_trace();
                audit::plugin_crashed(&self.correlation, &err.to_string(), &self.failure_context());
                let err = SandboxError::Crashed {
                    kind: self.kind,
                    phase,
                    context: self.failure_context(),
                    stack_trace,
                };
                self.fail(ControllerState::Crashed, err)
            }
        }
    }

    fn protocol_failure(&mut self, err: ChannelError) -> SandboxError {
        self.fail(ControllerState::Crashed, SandboxError::Protocol(err.to_string()))
    }

    fn fail(&mut self, state: ControllerState, err: SandboxError) -> SandboxError {
        self.state = state;
        if let Some(channel) = self.channel.as_mut() {
            channel.poison(ChannelError::Closed);
        }
        self.record(err)
    }

    fn record(&mut self, err: SandboxError) -> SandboxError {
        self.last_error = err.code();
        self.log.borrow_mut().error(&format!("ERROR: {err}"));
        err
    }

    fn reap_quietly(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Some(pid) = self.pid {
            self.exit = process::wait_for_exit(pid, REAP_GRACE).ok().flatten();
        }
    }

    /// Kill a sandbox whose handshake failed.
    fn abandon(&mut self) {
        if let Some(pid) = self.pid {
            let report = process::terminate(pid);
            self.exit = report.exit;
        }
        self.channel = None;
        self.state = ControllerState::Crashed;
    }

    fn ensure_state(&self, allowed: &[ControllerState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(SandboxError::InvalidState(format!(
            "{} sandbox is {:?}",
            self.kind, self.state
        )))
    }

    fn channel_mut(&mut self) -> Result<&mut Channel> {
        self.channel
            .as_mut()
            .ok_or_else(|| SandboxError::InvalidState("no sandbox channel".to_string()))
    }

    fn info(&self, text: &str) {
        self.log.borrow_mut().info(text);
    }

    fn debug(&self, text: &str) {
        self.log.borrow_mut().debug(text);
    }
}

impl Drop for SandboxController {
    fn drop(&mut self) {
        if self.state.has_process() {
            if let Err(e) = self.close_sandbox() {
                debug!("closing the sandbox on drop: {e}");
            }
        }
        if self.config.delete_log_files {
            for path in [self.log.borrow().path().map(PathBuf::from), self.sandbox_log_path()]
                .into_iter()
                .flatten()
            {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
