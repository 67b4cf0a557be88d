//! Credential validation logic.

use super::identity::RunAsIdentity;
use crate::config::types::{Result, SandboxError};

/// Plugins never run as root, whatever the configuration says.
pub fn validate_identity(identity: &RunAsIdentity) -> Result<()> {
    if identity.uid == 0 || identity.gid == 0 {
        return Err(SandboxError::Privilege(format!(
            "Refusing to run plugins as a root identity ({}: uid={}, gid={})",
            identity.name, identity.uid, identity.gid
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(uid: u32, gid: u32) -> RunAsIdentity {
        RunAsIdentity {
            name: "plugins".to_string(),
            uid,
            gid,
        }
    }

    #[test]
    fn root_uid_is_rejected() {
        assert!(validate_identity(&identity(0, 1000)).is_err());
    }

    #[test]
    fn root_gid_is_rejected() {
        assert!(validate_identity(&identity(1000, 0)).is_err());
    }

    #[test]
    fn unprivileged_identity_is_accepted() {
        assert!(validate_identity(&identity(1000, 1000)).is_ok());
    }
}
