use crate::config::types::{Result, SandboxError};
use nix::unistd::User;

/// Account the sandboxed process switches to before constructing plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAsIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl RunAsIdentity {
    /// Resolve a user name through the password database.
    ///
    /// Must run before entering the jail: `/etc/passwd` is not reachable afterwards.
    pub fn lookup(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .map_err(|e| SandboxError::Privilege(format!("Failed to look up user '{name}': {e}")))?
            .ok_or_else(|| SandboxError::Privilege(format!("Unknown user '{name}'")))?;
        Ok(Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_account_resolves() {
        let root = RunAsIdentity::lookup("root").unwrap();
        assert_eq!(root.uid, 0);
    }

    #[test]
    fn unknown_account_is_an_error() {
        assert!(RunAsIdentity::lookup("no-such-user-plugbox").is_err());
    }
}
