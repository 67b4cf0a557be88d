//! Starting the sandboxed process of a session.
use super::types::SpawnMode;
use crate::channel::Channel;
use crate::config::types::{to_sandbox_error, PluginKind, Result, SandboxConfiguration};
use crate::host::{self, HostOptions};
use crate::kernel::process;
use crate::utils::fd_closure::close_fds_except;
use nix::unistd::{execv, fork, ForkResult, Pid};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

/// Exit status of a child whose `exec` failed.
pub const EXEC_FAILED_EXIT_STATUS: i32 = 127;

/// Fork the sandboxed process and hand back the master end of its channel.
///
/// The slave end is closed in this process before returning; the child
/// closes every inherited descriptor except its own channel ends.
pub fn spawn_sandbox(
    mode: &SpawnMode,
    config: &SandboxConfiguration,
    kind: PluginKind,
    log_suffix: &str,
) -> Result<(Pid, Channel)> {
    let (master, slave) = Channel::pair()?;
    let options =
        HostOptions::from_configuration(config, kind, slave.read_fd(), slave.write_fd(), log_suffix);

    // Prepare exec arguments before fork: the child must not allocate more than needed.
    let exec_args = match mode {
        SpawnMode::Exec { program } => Some(exec_arguments(program, &options)?),
        SpawnMode::InProcess(_) => None,
    };

    // SAFETY: the child only closes descriptors, then either execs or runs
    // the host and exits without returning into the caller.
    match unsafe { fork() }.map_err(|e| to_sandbox_error("fork(sandbox)", e))? {
        ForkResult::Child => {
            let keep = [slave.read_fd(), slave.write_fd()];
            std::mem::forget(master);
            std::mem::forget(slave);
            let status = run_child(mode, options, exec_args, &keep);
            // SAFETY: leaving the forked child without running the parent's exit handlers.
            unsafe { libc::_exit(status) }
        }
        ForkResult::Parent { child } => {
            drop(slave);
            log::info!("Spawned {kind} sandbox (pid {child})");
            Ok((child, master))
        }
    }
}

fn run_child(
    mode: &SpawnMode,
    options: HostOptions,
    exec_args: Option<(CString, Vec<CString>)>,
    keep: &[i32],
) -> i32 {
    if let Err(e) = close_fds_except(keep) {
        log::warn!("{e}");
    }
    if let Err(e) = process::setup_parent_death_signal() {
        log::warn!("{e}");
    }

    match (mode, exec_args) {
        (SpawnMode::InProcess(registry), _) => host::run_host(options, registry.clone()),
        (SpawnMode::Exec { .. }, Some((program, args))) => {
            if let Err(e) = execv(&program, &args) {
                log::error!("exec {program:?} failed: {e}");
            }
            EXEC_FAILED_EXIT_STATUS
        }
        (SpawnMode::Exec { .. }, None) => EXEC_FAILED_EXIT_STATUS,
    }
}

fn exec_arguments(
    program: &std::path::Path,
    options: &HostOptions,
) -> Result<(CString, Vec<CString>)> {
    let to_cstring = |bytes: &[u8]| {
        CString::new(bytes).map_err(|e| to_sandbox_error("sandbox argument", e))
    };
    let program = to_cstring(program.as_os_str().as_bytes())?;
    let mut args = vec![program.clone()];
    for arg in options.to_args() {
        args.push(to_cstring(arg.as_bytes())?);
    }
    Ok((program, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn exec_arguments_start_with_the_program() {
        let options = HostOptions::new(PluginKind::Heuristics, 4, 5);
        let (program, args) = exec_arguments(Path::new("/usr/bin/plugbox"), &options).unwrap();
        assert_eq!(program.to_str().unwrap(), "/usr/bin/plugbox");
        assert_eq!(args[0], program);
        assert_eq!(args[1].to_str().unwrap(), "sandbox");
        assert_eq!(args.last().unwrap().to_str().unwrap(), "heuristics");
    }
}
