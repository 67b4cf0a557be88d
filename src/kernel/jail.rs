//! chroot jail entered before untrusted constructors run.
use crate::config::types::{to_sandbox_error, Result, SandboxError};
use std::path::Path;

/// chdir + chroot into `dir`. Requires root.
pub fn enter_jail(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(SandboxError::Config(format!(
            "Jail folder {} does not exist",
            dir.display()
        )));
    }
    nix::unistd::chdir(dir).map_err(|e| to_sandbox_error("chdir(jail)", e))?;
    nix::unistd::chroot(dir).map_err(|e| to_sandbox_error("chroot(jail)", e))?;
    nix::unistd::chdir("/").map_err(|e| to_sandbox_error("chdir(/)", e))?;
    log::info!("Entered jail {}", dir.display());
    Ok(())
}
