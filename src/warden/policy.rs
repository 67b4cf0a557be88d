//! Deny-list decisions, kept free of process state so they can be tested directly.
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Device nodes any code may open; they expose no plugin-reachable state.
const ALWAYS_OPENABLE: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

/// Untrusted section the Warden is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuardedPhase {
    Loading = 1,
    Construction = 2,
}

impl GuardedPhase {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Loading),
            2 => Some(Self::Construction),
            _ => None,
        }
    }
}

impl std::fmt::Display for GuardedPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => f.write_str("loading"),
            Self::Construction => f.write_str("construction"),
        }
    }
}

/// An intercepted call, as seen by the Warden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    /// Process duplication or replacement (`fork`, `execve`, `system`, ...)
    Process(&'static str),
    /// File opening through one of the `open`/`fopen` entry points
    OpenFile { call: &'static str, path: &'a [u8] },
}

impl Operation<'_> {
    pub fn call_name(&self) -> &'static str {
        match self {
            Self::Process(name) => name,
            Self::OpenFile { call, .. } => call,
        }
    }

    /// Name reported to the trusted side when the operation is denied.
    pub fn describe(&self) -> String {
        match self {
            Self::Process(name) => (*name).to_string(),
            Self::OpenFile { call, path } => {
                format!("{call}({})", String::from_utf8_lossy(path))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// Decide an operation while armed. Process operations are always denied;
/// file opens are allowed only below one of `roots`.
pub fn evaluate(operation: &Operation<'_>, roots: &[PathBuf], cwd: &Path) -> Verdict {
    match operation {
        Operation::Process(_) => Verdict::Deny,
        Operation::OpenFile { path, .. } => {
            let requested = Path::new(OsStr::from_bytes(path));
            let normalized = normalize(requested, cwd);
            if ALWAYS_OPENABLE.iter().any(|p| normalized == Path::new(p))
                || is_within(&normalized, roots, cwd)
            {
                Verdict::Allow
            } else {
                Verdict::Deny
            }
        }
    }
}

/// Lexically resolve `path` against `cwd`, dropping `.` and folding `..`.
pub fn normalize(path: &Path, cwd: &Path) -> PathBuf {
    let joined;
    let path = if path.is_absolute() {
        path
    } else {
        joined = cwd.join(path);
        joined.as_path()
    };

    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Whether `path` (already normalized) lies at or below one of `roots`.
pub fn is_within(path: &Path, roots: &[PathBuf], cwd: &Path) -> bool {
    roots
        .iter()
        .map(|root| normalize(root, cwd))
        .any(|root| path.starts_with(&root))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> Vec<PathBuf> {
        vec![PathBuf::from("/srv/plugins"), PathBuf::from("/srv/scripts/")]
    }

    fn open(path: &str) -> Operation<'_> {
        Operation::OpenFile {
            call: "open",
            path: path.as_bytes(),
        }
    }

    #[test]
    fn process_operations_are_always_denied() {
        for name in ["fork", "vfork", "execve", "system", "posix_spawnp"] {
            assert_eq!(
                evaluate(&Operation::Process(name), &roots(), Path::new("/")),
                Verdict::Deny
            );
        }
    }

    #[test]
    fn files_below_roots_are_allowed() {
        let cwd = Path::new("/home/user");
        assert_eq!(evaluate(&open("/srv/plugins/edges.so"), &roots(), cwd), Verdict::Allow);
        assert_eq!(evaluate(&open("/srv/scripts/analyze.py"), &roots(), cwd), Verdict::Allow);
        assert_eq!(evaluate(&open("/srv/plugins"), &roots(), cwd), Verdict::Allow);
    }

    #[test]
    fn traversal_out_of_a_root_is_denied() {
        let cwd = Path::new("/srv/plugins");
        assert_eq!(evaluate(&open("../../etc/passwd"), &roots(), cwd), Verdict::Deny);
        assert_eq!(
            evaluate(&open("/srv/plugins/../secrets/key"), &roots(), cwd),
            Verdict::Deny
        );
        assert_eq!(evaluate(&open("data/weights.bin"), &roots(), cwd), Verdict::Allow);
    }

    #[test]
    fn sibling_with_common_prefix_is_not_inside_root() {
        assert_eq!(
            evaluate(&open("/srv/plugins-evil/x"), &roots(), Path::new("/")),
            Verdict::Deny
        );
    }

    #[test]
    fn device_nodes_are_openable() {
        assert_eq!(evaluate(&open("/dev/urandom"), &[], Path::new("/")), Verdict::Allow);
        assert_eq!(evaluate(&open("/dev/sda"), &[], Path::new("/")), Verdict::Deny);
    }

    #[test]
    fn normalize_never_climbs_above_root() {
        assert_eq!(normalize(Path::new("/../../etc"), Path::new("/")), PathBuf::from("/etc"));
        assert_eq!(normalize(Path::new("./a/./b/.."), Path::new("/w")), PathBuf::from("/w/a"));
    }

    #[test]
    fn denied_open_names_call_and_path() {
        assert_eq!(open("/etc/shadow").describe(), "open(/etc/shadow)");
        assert_eq!(Operation::Process("execve").describe(), "execve");
    }
}
