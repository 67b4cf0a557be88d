//! Switch the sandboxed process to the run-as identity.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid.

use super::identity::RunAsIdentity;
use super::validation::validate_identity;
use crate::config::types::{Result, SandboxError};

/// validate -> clear groups -> setresgid -> setresuid -> verify.
pub fn drop_to_identity(identity: &RunAsIdentity) -> Result<()> {
    validate_identity(identity)?;
    clear_supplementary_groups()?;
    // CRITICAL: GID before UID
    set_gid(identity.gid)?;
    set_uid(identity.uid)?;
    verify_transition(identity)?;

    log::info!(
        "Running as {} (uid={}, gid={})",
        identity.name,
        identity.uid,
        identity.gid
    );
    Ok(())
}

fn clear_supplementary_groups() -> Result<()> {
    nix::unistd::setgroups(&[])
        .map_err(|e| SandboxError::Privilege(format!("Failed to clear supplementary groups: {e}")))
}

fn set_gid(gid: u32) -> Result<()> {
    // SAFETY: plain syscall wrapper; gid validated non-root by the caller.
    let rc = unsafe { libc::setresgid(gid, gid, gid) };
    if rc != 0 {
        return Err(SandboxError::Privilege(format!(
            "Failed to setresgid({gid}): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn set_uid(uid: u32) -> Result<()> {
    // SAFETY: plain syscall wrapper; must follow set_gid.
    let rc = unsafe { libc::setresuid(uid, uid, uid) };
    if rc != 0 {
        return Err(SandboxError::Privilege(format!(
            "Failed to setresuid({uid}): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn verify_transition(identity: &RunAsIdentity) -> Result<()> {
    use nix::unistd::{getegid, geteuid, getgid, getuid};

    let (real_uid, effective_uid) = (getuid().as_raw(), geteuid().as_raw());
    let (real_gid, effective_gid) = (getgid().as_raw(), getegid().as_raw());

    if real_uid != identity.uid || effective_uid != identity.uid {
        return Err(SandboxError::Privilege(format!(
            "UID verification failed: expected {}, got real={real_uid}, effective={effective_uid}",
            identity.uid
        )));
    }
    if real_gid != identity.gid || effective_gid != identity.gid {
        return Err(SandboxError::Privilege(format!(
            "GID verification failed: expected {}, got real={real_gid}, effective={effective_gid}",
            identity.gid
        )));
    }
    Ok(())
}
