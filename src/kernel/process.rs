//! Child process lifecycle: parent-death signal, termination and reaping.
use crate::config::types::{to_sandbox_error, Result};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL.
pub const TERMINATION_GRACE: Duration = Duration::from_millis(200);

/// How a sandboxed process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

/// Signal escalation report for forced termination.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub exit: Option<ChildExit>,
}

/// Kill this process when its parent dies. Call in the child right after fork.
pub fn setup_parent_death_signal() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::prctl;
        use nix::sys::signal::Signal;

        prctl::set_pdeathsig(Signal::SIGKILL)
            .map_err(|e| to_sandbox_error("Failed to set parent death signal", e))?;
        log::debug!("Parent death signal (SIGKILL) configured");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        log::warn!("Parent death signal not supported on this platform");
        Ok(())
    }
}

/// Reap `pid` if it already ended.
pub fn try_reap(pid: Pid) -> Result<Option<ChildExit>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(Some(ChildExit::Exited(code))),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(Some(ChildExit::Signaled(sig as i32))),
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(None),
            Err(e) => return Err(to_sandbox_error("waitpid(sandbox)", e)),
        }
    }
}

/// Wait up to `timeout` for `pid` to end, polling.
pub fn wait_for_exit(pid: Pid, timeout: Duration) -> Result<Option<ChildExit>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(exit) = try_reap(pid)? {
            return Ok(Some(exit));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// SIGTERM, grace period, SIGKILL, then reap.
pub fn terminate(pid: Pid) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    // SAFETY: kill(2) on a pid this process spawned.
    if unsafe { libc::kill(pid.as_raw(), libc::SIGTERM) } == 0 {
        report.term_sent = true;
    }

    report.exit = wait_for_exit(pid, TERMINATION_GRACE).ok().flatten();
    if report.exit.is_none() {
        if unsafe { libc::kill(pid.as_raw(), libc::SIGKILL) } == 0 {
            report.kill_sent = true;
        }
        report.exit = blocking_reap(pid);
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

fn blocking_reap(pid: Pid) -> Option<ChildExit> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Some(ChildExit::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Some(ChildExit::Signaled(sig as i32)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn terminate_escalates_and_reaps() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let report = terminate(pid);
        assert!(report.term_sent);
        assert_eq!(report.exit, Some(ChildExit::Signaled(libc::SIGTERM)));
    }

    #[test]
    fn wait_for_exit_reports_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        assert_eq!(
            wait_for_exit(pid, Duration::from_secs(5)).unwrap(),
            Some(ChildExit::Exited(3))
        );
    }
}
