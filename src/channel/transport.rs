//! Raw pipe transport shared by every copy of one channel endpoint.
use crate::protocol::{FrameAssembler, Packet};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 64 * 1024;

/// Result of waiting for the read end to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Readable,
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct Transport {
    pub(crate) read_fd: RawFd,
    pub(crate) write_fd: RawFd,
    pub(crate) assembler: FrameAssembler,
    pub(crate) current: Option<Packet>,
    open: bool,
}

impl Transport {
    pub(crate) fn new(read_fd: RawFd, write_fd: RawFd) -> Self {
        Self {
            read_fd,
            write_fd,
            assembler: FrameAssembler::new(),
            current: None,
            open: true,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    /// Write every byte, retrying on interruption and short writes.
    pub(crate) fn write_all(&self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            let rc = unsafe {
                libc::write(self.write_fd, bytes.as_ptr() as *const libc::c_void, bytes.len())
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if rc == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "pipe accepted no bytes"));
            }
            bytes = &bytes[rc as usize..];
        }
        Ok(())
    }

    /// Block until the read end is readable or the deadline passes.
    pub(crate) fn wait_readable(&self, deadline: Option<Instant>) -> io::Result<Readiness> {
        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(Readiness::TimedOut);
                    }
                    millis_rounded_up(left)
                }
            };

            let mut pfd = libc::pollfd {
                fd: self.read_fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if rc == 0 {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Ok(Readiness::TimedOut);
                }
                continue;
            }
            // POLLHUP/POLLERR surface through the following read.
            return Ok(Readiness::Readable);
        }
    }

    /// One read into the assembler. `Ok(0)` means the peer closed its end.
    pub(crate) fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let rc = unsafe {
                libc::read(self.read_fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let n = rc as usize;
            self.assembler.extend(&chunk[..n]);
            return Ok(n);
        }
    }

    pub(crate) fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = nix::unistd::close(self.read_fd);
        let _ = nix::unistd::close(self.write_fd);
        self.current = None;
        self.assembler.clear();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn millis_rounded_up(duration: Duration) -> libc::c_int {
    let millis = duration.as_micros().div_ceil(1000);
    millis.min(libc::c_int::MAX as u128) as libc::c_int
}

/// Mark a descriptor close-on-exec.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_milliseconds_round_up() {
        assert_eq!(millis_rounded_up(Duration::from_micros(1)), 1);
        assert_eq!(millis_rounded_up(Duration::from_millis(250)), 250);
        assert_eq!(millis_rounded_up(Duration::from_micros(250_001)), 251);
    }
}
