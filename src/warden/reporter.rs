use super::{Violation, WardenListener, WardenStatus};
use crate::protocol::MessageKind;
use std::os::unix::io::RawFd;

const REPORT_CAPACITY: usize = 1024;

/// Listener that tells the trusted side about a violation over the channel.
///
/// It runs inside the allocator on the memory path, so packets are built in
/// a stack buffer and written with a raw `write(2)`.
pub struct ChannelViolationReporter {
    write_fd: RawFd,
}

impl ChannelViolationReporter {
    pub fn new(write_fd: RawFd) -> Self {
        Self { write_fd }
    }

}

/// Write a whole packet with `write(2)`, giving up silently on failure.
///
/// Safe to call from a signal handler or from inside the allocator.
pub(crate) fn send_raw(fd: RawFd, packet: &StackPacket) {
    let mut bytes = packet.bytes();
    while !bytes.is_empty() {
        let rc = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if rc < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if rc == 0 {
            return;
        }
        bytes = &bytes[rc as usize..];
    }
}

impl WardenListener for ChannelViolationReporter {
    fn on_violation(&self, violation: &Violation<'_>) {
        let packet = encode_violation(violation);
        send_raw(self.write_fd, &packet);
    }
}

/// A packet assembled without touching the heap.
pub(crate) struct StackPacket {
    buf: [u8; REPORT_CAPACITY],
    len: usize,
}

impl StackPacket {
    pub(crate) fn new(kind: MessageKind) -> Self {
        let mut packet = Self {
            buf: [0u8; REPORT_CAPACITY],
            len: 8,
        };
        packet.buf[0..4].copy_from_slice(&kind.as_u32().to_le_bytes());
        packet
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        let payload = (self.len - 8) as u32;
        self.buf[4..8].copy_from_slice(&payload.to_le_bytes());
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Both packets end with the subject's index, `u32::MAX` when none was named.
pub(crate) fn encode_violation(violation: &Violation<'_>) -> StackPacket {
    let subject = violation.subject.unwrap_or(u32::MAX).to_le_bytes();
    let mut packet = match violation.status {
        WardenStatus::MemoryLimitReached => {
            let mut packet = StackPacket::new(MessageKind::MemoryLimitReached);
            packet.push(&violation.peak.to_le_bytes());
            packet.push(&violation.budget.to_le_bytes());
            packet
        }
        WardenStatus::ForbiddenCall => {
            let mut packet = StackPacket::new(MessageKind::ForbiddenSystemCall);
            let name = truncate_utf8(violation.operation, REPORT_CAPACITY - 16);
            packet.push(&(name.len() as u32).to_le_bytes());
            packet.push(name.as_bytes());
            packet
        }
    };
    packet.push(&subject);
    packet
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
