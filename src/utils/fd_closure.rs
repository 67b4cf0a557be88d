//! Descriptor closure in a freshly spawned sandboxed process.
//!
//! The child keeps stdio and its channel descriptors and closes everything
//! else it inherited, so no transport of another session outlives its owner.
use crate::config::types::{Result, SandboxError};
use nix::unistd::close;
use std::fs;
use std::os::unix::io::RawFd;

/// Close every descriptor above 2 that is not in `keep`.
pub fn close_fds_except(keep: &[RawFd]) -> Result<()> {
    let mut keep: Vec<RawFd> = keep.iter().copied().filter(|fd| *fd > 2).collect();
    keep.sort_unstable();
    keep.dedup();

    #[cfg(target_os = "linux")]
    {
        if close_ranges_around(&keep) {
            log::debug!("Closed inherited FDs using close_range");
            return Ok(());
        }
    }

    close_fds_via_proc(&keep)
}

/// Ranges `[first, last]` of descriptors to close, above 2 and between kept ones.
fn ranges_to_close(keep: &[RawFd]) -> Vec<(u32, u32)> {
    let mut ranges = Vec::with_capacity(keep.len() + 1);
    let mut first: u32 = 3;
    for &fd in keep {
        let fd = fd as u32;
        if fd > first {
            ranges.push((first, fd - 1));
        }
        first = fd + 1;
    }
    ranges.push((first, u32::MAX));
    ranges
}

#[cfg(target_os = "linux")]
fn close_ranges_around(keep: &[RawFd]) -> bool {
    const SYS_CLOSE_RANGE: libc::c_long = 436;

    for (first, last) in ranges_to_close(keep) {
        // SAFETY: close_range only closes descriptors; no memory is touched.
        let rc = unsafe { libc::syscall(SYS_CLOSE_RANGE, first, last, 0 as libc::c_uint) };
        if rc != 0 {
            return false;
        }
    }
    true
}

fn close_fds_via_proc(keep: &[RawFd]) -> Result<()> {
    let fds = get_open_fds()?;
    let mut closed = 0usize;
    for fd in fds.into_iter().filter(|fd| *fd > 2 && !keep.contains(fd)) {
        match close(fd) {
            Ok(()) => closed += 1,
            Err(nix::errno::Errno::EBADF) => {}
            Err(e) => log::warn!("Failed to close inherited fd {fd}: {e}"),
        }
    }
    log::debug!("Closed {closed} inherited FDs via /proc/self/fd");
    Ok(())
}

/// Open descriptors of the current process, sorted.
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";
    let entries = fs::read_dir(fd_dir)
        .map_err(|e| SandboxError::Process(format!("Failed to read {fd_dir}: {e}")))?;

    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<RawFd>().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fds_include_stdio() {
        let fds = get_open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn ranges_skip_kept_descriptors() {
        assert_eq!(ranges_to_close(&[]), vec![(3, u32::MAX)]);
        assert_eq!(
            ranges_to_close(&[5, 6, 9]),
            vec![(3, 4), (7, 8), (10, u32::MAX)]
        );
        assert_eq!(ranges_to_close(&[3]), vec![(4, u32::MAX)]);
    }
}
