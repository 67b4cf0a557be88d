//! Resource limits and process attributes of the sandboxed process.
use crate::config::types::{Result, SandboxError};

fn set_rlimit(name: &str, resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: plain syscall wrapper over a stack value.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        return Ok(());
    }
    Err(SandboxError::Process(format!(
        "Failed to apply {name}={soft} (hard={hard}): {}",
        std::io::Error::last_os_error()
    )))
}

fn get_rlimit(resource: libc::__rlimit_resource_t) -> Result<(u64, u64)> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the provided struct only.
    let rc = unsafe { libc::getrlimit(resource, &mut limit) };
    if rc != 0 {
        return Err(SandboxError::Process(format!(
            "getrlimit failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok((limit.rlim_cur as u64, limit.rlim_max as u64))
}

/// Let a crash produce a core file as large as the hard limit allows.
pub fn raise_core_limit() -> Result<()> {
    let (_, hard) = get_rlimit(libc::RLIMIT_CORE)?;
    set_rlimit("RLIMIT_CORE", libc::RLIMIT_CORE, hard, hard)
}

/// Keep the process dumpable after a credential change.
pub fn mark_dumpable() -> Result<()> {
    // SAFETY: PR_SET_DUMPABLE takes a single integer argument.
    let rc = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1 as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        return Err(SandboxError::Process(format!(
            "prctl(PR_SET_DUMPABLE) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// No new descriptors and no new processes from here on.
pub fn forbid_new_files_and_processes() -> Result<()> {
    set_rlimit("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, 0, 0)?;
    set_rlimit("RLIMIT_NPROC", libc::RLIMIT_NPROC, 0, 0)?;
    log::info!("RLIMIT_NOFILE and RLIMIT_NPROC set to 0");
    Ok(())
}

/// Whether the current process runs with root privileges.
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_limit_can_be_read() {
        let (soft, hard) = get_rlimit(libc::RLIMIT_CORE).unwrap();
        assert!(soft <= hard);
    }
}
