use crate::config::types::{
    PluginKind, SandboxConfiguration, SandboxError, DEFAULT_MEMORY_BUDGET,
};
use crate::core::{SandboxController, SessionReport, SpawnMode};
use crate::host::{self, HostOptions, PluginRegistry};
use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON); absent fields take their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Audit trail file (JSON lines)
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the sandboxed process of a controller (internal)
    #[command(hide = true)]
    Sandbox(SandboxArgs),
    /// Load and construct one plugin in a sandbox, then report how it went
    Check(CheckArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct SandboxArgs {
    /// Descriptor the sandbox reads commands from
    #[arg(long = "readfd")]
    read_fd: i32,
    /// Descriptor the sandbox writes answers to
    #[arg(long = "writefd")]
    write_fd: i32,
    /// User to run the plugins as (privileged runs)
    #[arg(long)]
    username: Option<String>,
    #[arg(long = "logfolder")]
    log_folder: Option<PathBuf>,
    #[arg(long = "logsuffix", default_value = "")]
    log_suffix: String,
    /// Folder receiving the saved model files
    #[arg(long = "outputfolder")]
    output_folder: Option<PathBuf>,
    /// Folder to chroot into before construction (privileged runs)
    #[arg(long = "jailfolder")]
    jail_folder: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_MEMORY_BUDGET)]
    memory_budget: u64,
    /// Folder plugins may open files from (repeatable)
    #[arg(long = "trusted-root")]
    trusted_roots: Vec<PathBuf>,
    /// Accept root privileges without jail folder and username
    #[arg(long)]
    allow_root: bool,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// heuristics, classifier or goalplanner
    kind: String,
}

#[derive(Args)]
struct CheckArgs {
    /// heuristics, classifier or goalplanner
    kind: String,
    /// Name of the plugin library, without extension
    plugin: String,
    /// Folder containing `<plugin>.so`
    #[arg(long)]
    folder: PathBuf,
    /// Model file handed to a predictor
    #[arg(long)]
    model: Option<PathBuf>,
    /// Internal data file handed to a classifier
    #[arg(long)]
    internal_data: Option<PathBuf>,
    /// Program started as the sandboxed process (defaults to this executable)
    #[arg(long)]
    program: Option<PathBuf>,
}

fn parse_kind(value: &str) -> Result<PluginKind> {
    PluginKind::from_arg(value).ok_or_else(|| {
        anyhow!("unknown plugin kind '{value}' (expected heuristics, classifier, goalplanner or instruments)")
    })
}

fn load_configuration(path: Option<&PathBuf>) -> Result<SandboxConfiguration> {
    match path {
        Some(path) => SandboxConfiguration::load_from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(SandboxConfiguration::default()),
    }
}

extern "C" fn signal_handler(sig: i32) {
    // Only async-signal-safe calls here.
    let msg = b"plugbox: signal received, exiting\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sandbox(args) => run_sandbox(args),
        Commands::Check(args) => {
            setup_signal_handlers();
            crate::observability::audit::init_audit_logger(cli.audit_log)?;
            let config = load_configuration(cli.config.as_ref())?;
            let report = check_plugin(&args, config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.success {
                Ok(())
            } else {
                Err(anyhow!("{} check failed", report.kind))
            }
        }
        Commands::Config => {
            let config = load_configuration(cli.config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// The sandboxed-process role. Never returns: the process exits with the
/// host's status so that the controller can tell why it ended.
fn run_sandbox(args: SandboxArgs) -> Result<()> {
    let kind = parse_kind(&args.kind)?;
    let options = HostOptions {
        username: args.username,
        log_dir: args.log_folder,
        log_suffix: args.log_suffix,
        output_dir: args.output_folder,
        jail_dir: args.jail_folder,
        memory_budget: args.memory_budget,
        verbosity: args.verbose,
        allow_root: args.allow_root,
        trusted_roots: args.trusted_roots,
        ..HostOptions::new(kind, args.read_fd, args.write_fd)
    };
    std::process::exit(host::run_host(options, PluginRegistry::new()));
}

fn check_plugin(args: &CheckArgs, config: SandboxConfiguration) -> Result<SessionReport> {
    let kind = parse_kind(&args.kind)?;
    let program = match &args.program {
        Some(program) => program.clone(),
        None => std::env::current_exe().unwrap_or_else(|_| config.sandbox_program.clone()),
    };

    let config_fingerprint = config.fingerprint();
    let started = Instant::now();
    let mut controller = SandboxController::new(kind, config);
    let outcome = run_check(&mut controller, args, program);
    let stack_trace = match &outcome {
        Err(SandboxError::Crashed { stack_trace, .. }) => stack_trace.clone(),
        _ => None,
    };
    let close = controller.close_sandbox();

    let error = outcome.as_ref().err().or(close.as_ref().err());
    Ok(SessionReport {
        kind,
        plugin: args.plugin.clone(),
        success: error.is_none(),
        state: controller.state(),
        error_code: error.map_or(controller.last_error(), SandboxError::code),
        error: error.map(ToString::to_string),
        context: error
            .and_then(SandboxError::context)
            .map(str::to_string)
            .filter(|context| !context.is_empty()),
        stack_trace,
        sandbox_pid: controller.sandbox_pid(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        config_fingerprint,
    })
}

fn run_check(
    controller: &mut SandboxController,
    args: &CheckArgs,
    program: PathBuf,
) -> crate::config::types::Result<()> {
    controller.create_sandbox(SpawnMode::Exec { program })?;
    controller.set_plugins_folder(&args.folder)?;
    controller.set_context("Method: loading\n");
    controller.load_plugin(&args.plugin)?;
    if controller.kind().is_predictor() {
        controller.use_model(args.model.clone(), args.internal_data.clone())?;
    }
    controller.set_context("Method: constructor\n");
    controller.create_plugins()?;
    controller.ping()
}
