//! Communication Channel: one end of the two-process packet connection.
//!
//! A [`Channel`] is a handle onto a reference-counted transport. Cloning a
//! handle shares the pipe descriptors, the receive buffer and the packet
//! being read; it never duplicates them. Each process closes the handles
//! it owns exactly once (dropping the last handle closes the transport).

mod transport;

use crate::config::types::ErrorCode;
use crate::observability::session_log::{Direction, SharedSessionLog};
use crate::protocol::{Decode, MessageKind, PacketError, PacketWriter};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use transport::{Readiness, Transport};

/// Which side of the process pair a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Trusted orchestrator side
    Master,
    /// Sandboxed process side
    Slave,
}

/// Channel failures. Once recorded, every later operation reports the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("the sandboxed process crashed")]
    SlaveCrashed,

    #[error("the sandboxed process did not answer within {0:?}")]
    SlaveTimeout(Duration),

    #[error("the trusted process went away")]
    MasterGone,

    #[error("{0}")]
    Packet(#[from] PacketError),

    #[error("no packet has been received")]
    NoPacket,

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("the channel is closed")]
    Closed,
}

impl ChannelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SlaveCrashed | Self::MasterGone => ErrorCode::ChannelSlaveCrashed,
            Self::SlaveTimeout(_) => ErrorCode::ChannelSlaveTimeout,
            Self::Packet(PacketError::EndOfPacket { .. }) => ErrorCode::ChannelEndOfPacket,
            Self::Packet(_) | Self::NoPacket => ErrorCode::ChannelProtocol,
            Self::Io(_) | Self::Closed => ErrorCode::ChannelIo,
        }
    }

    /// Whether the failure ends the channel for good.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Packet(PacketError::EndOfPacket { .. }) | Self::NoPacket)
    }
}

struct Shared {
    transport: Transport,
    failure: Option<ChannelError>,
}

/// Handle onto one endpoint of a channel pair.
pub struct Channel {
    shared: Rc<RefCell<Shared>>,
    writer: PacketWriter,
    endpoint: Endpoint,
    log: Option<SharedSessionLog>,
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
            writer: PacketWriter::new(),
            endpoint: self.endpoint,
            log: self.log.clone(),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint)
            .field("read_fd", &shared.transport.read_fd)
            .field("write_fd", &shared.transport.write_fd)
            .field("failure", &shared.failure)
            .finish()
    }
}

impl Channel {
    /// Create a connected (master, slave) pair over two pipes.
    ///
    /// The master descriptors are close-on-exec; the slave descriptors are
    /// left inheritable for the sandboxed process.
    pub fn pair() -> Result<(Channel, Channel), ChannelError> {
        crate::kernel::signal::ignore_sigpipe();

        let (to_slave_read, to_slave_write) =
            nix::unistd::pipe().map_err(|e| ChannelError::Io(format!("pipe(to slave): {e}")))?;
        let (to_master_read, to_master_write) = match nix::unistd::pipe() {
            Ok(fds) => fds,
            Err(e) => {
                let _ = nix::unistd::close(to_slave_read);
                let _ = nix::unistd::close(to_slave_write);
                return Err(ChannelError::Io(format!("pipe(to master): {e}")));
            }
        };

        let master = Channel::from_fds(to_master_read, to_slave_write, Endpoint::Master);
        let slave = Channel::from_fds(to_slave_read, to_master_write, Endpoint::Slave);
        for fd in [to_master_read, to_slave_write] {
            transport::set_cloexec(fd).map_err(|e| ChannelError::Io(format!("fcntl({fd}): {e}")))?;
        }
        Ok((master, slave))
    }

    /// Adopt inherited descriptors, as the sandboxed process does at start-up.
    pub fn from_fds(read_fd: RawFd, write_fd: RawFd, endpoint: Endpoint) -> Channel {
        Channel {
            shared: Rc::new(RefCell::new(Shared {
                transport: Transport::new(read_fd, write_fd),
                failure: None,
            })),
            writer: PacketWriter::new(),
            endpoint,
            log: None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn read_fd(&self) -> RawFd {
        self.shared.borrow().transport.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.shared.borrow().transport.write_fd
    }

    /// Number of handles sharing this transport in the current process.
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.shared)
    }

    /// Record sent and received message kinds in a session log.
    pub fn attach_log(&mut self, log: SharedSessionLog) {
        self.log = Some(log);
    }

    /// Usable for another round trip.
    pub fn good(&self) -> bool {
        let shared = self.shared.borrow();
        shared.failure.is_none() && shared.transport.is_open()
    }

    pub fn last_error(&self) -> Option<ChannelError> {
        self.shared.borrow().failure.clone()
    }

    /// Begin a new outgoing packet, discarding any unsent one.
    pub fn start_packet(&mut self, kind: MessageKind) -> &mut PacketWriter {
        self.writer.start(kind)
    }

    /// Flush the packet built since [`Channel::start_packet`] in one write sequence.
    pub fn send_packet(&mut self) -> Result<(), ChannelError> {
        self.check_usable()?;
        let kind = self.writer.kind().ok_or(PacketError::NotStarted)?;
        let payload_len = self.writer.payload_len();
        let bytes = self.writer.finish()?;

        let result = self.shared.borrow().transport.write_all(bytes);
        self.writer.reset();
        if let Err(err) = result {
            log::debug!("send of {kind} failed: {err}");
            let failure = self.peer_failure(err.raw_os_error());
            return Err(self.fail(failure));
        }

        if let Some(log) = &self.log {
            log.borrow_mut().packet(Direction::Sent, kind, payload_len);
        }
        Ok(())
    }

    /// Send a packet with no fields.
    pub fn send_empty(&mut self, kind: MessageKind) -> Result<(), ChannelError> {
        self.start_packet(kind);
        self.send_packet()
    }

    /// Block until a full packet arrives, the timeout elapses or the peer is gone.
    ///
    /// `None` waits forever. Timeouts and peer loss are recorded: the channel
    /// is unusable afterwards.
    pub fn receive_packet(&mut self, timeout: Option<Duration>) -> Result<MessageKind, ChannelError> {
        self.check_usable()?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let next = self.shared.borrow_mut().transport.assembler.next_packet();
            match next {
                Ok(Some(packet)) => {
                    let kind = packet.kind();
                    let payload_len = packet.payload().len();
                    self.shared.borrow_mut().transport.current = Some(packet);
                    if let Some(log) = &self.log {
                        log.borrow_mut().packet(Direction::Received, kind, payload_len);
                    }
                    return Ok(kind);
                }
                Ok(None) => {}
                Err(err) => return Err(self.fail(ChannelError::Packet(err))),
            }

            let readiness = self.shared.borrow().transport.wait_readable(deadline);
            match readiness {
                Ok(Readiness::TimedOut) => {
                    let waited = timeout.unwrap_or_default();
                    return Err(self.fail(ChannelError::SlaveTimeout(waited)));
                }
                Ok(Readiness::Readable) => {}
                Err(err) => {
                    let failure = self.peer_failure(err.raw_os_error());
                    return Err(self.fail(failure));
                }
            }

            let filled = self.shared.borrow_mut().transport.fill();
            match filled {
                Ok(0) => {
                    let failure = self.peer_failure(None);
                    return Err(self.fail(failure));
                }
                Ok(_) => {}
                Err(err) => {
                    let failure = self.peer_failure(err.raw_os_error());
                    return Err(self.fail(failure));
                }
            }
        }
    }

    /// Kind of the packet currently being read.
    pub fn current_kind(&self) -> Option<MessageKind> {
        self.shared.borrow().transport.current.as_ref().map(|p| p.kind())
    }

    /// Read the next field of the most recently received packet.
    pub fn read<T: Decode>(&mut self) -> Result<T, ChannelError> {
        self.with_packet(|packet| packet.read::<T>())
    }

    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        self.with_packet(|packet| packet.read_raw(len))
    }

    pub fn read_u32_block(&mut self, count: usize) -> Result<Vec<u32>, ChannelError> {
        self.with_packet(|packet| packet.read_u32_block(count))
    }

    pub fn read_f32_block(&mut self, count: usize) -> Result<Vec<f32>, ChannelError> {
        self.with_packet(|packet| packet.read_f32_block(count))
    }

    /// All fields of the current packet have been read.
    pub fn is_at_end(&self) -> bool {
        self.shared
            .borrow()
            .transport
            .current
            .as_ref()
            .map_or(true, |p| p.is_at_end())
    }

    /// Close the shared transport. Later operations fail with [`ChannelError::Closed`].
    pub fn close(&mut self) {
        self.shared.borrow_mut().transport.close();
    }

    /// Mark the channel failed without touching the transport.
    pub fn poison(&mut self, failure: ChannelError) {
        let mut shared = self.shared.borrow_mut();
        if shared.failure.is_none() {
            shared.failure = Some(failure);
        }
    }

    fn with_packet<T>(
        &mut self,
        read: impl FnOnce(&mut crate::protocol::Packet) -> Result<T, PacketError>,
    ) -> Result<T, ChannelError> {
        let mut shared = self.shared.borrow_mut();
        let packet = shared.transport.current.as_mut().ok_or(ChannelError::NoPacket)?;
        read(packet).map_err(ChannelError::Packet)
    }

    fn check_usable(&self) -> Result<(), ChannelError> {
        let shared = self.shared.borrow();
        if let Some(failure) = &shared.failure {
            return Err(failure.clone());
        }
        if !shared.transport.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn peer_failure(&self, errno: Option<i32>) -> ChannelError {
        match (errno, self.endpoint) {
            (None, Endpoint::Master) | (Some(libc::EPIPE), Endpoint::Master) => {
                ChannelError::SlaveCrashed
            }
            (None, Endpoint::Slave) | (Some(libc::EPIPE), Endpoint::Slave) => {
                ChannelError::MasterGone
            }
            (Some(code), _) => ChannelError::Io(std::io::Error::from_raw_os_error(code).to_string()),
        }
    }

    fn fail(&mut self, failure: ChannelError) -> ChannelError {
        self.poison(failure.clone());
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paired_endpoints_observe_each_other() {
        let (mut master, mut slave) = Channel::pair().unwrap();

        master.start_packet(MessageKind::LoadPlugin).add("edges");
        master.send_packet().unwrap();

        assert_eq!(
            slave.receive_packet(Some(Duration::from_secs(1))).unwrap(),
            MessageKind::LoadPlugin
        );
        assert_eq!(slave.read::<String>().unwrap(), "edges");
        assert!(slave.is_at_end());

        slave.start_packet(MessageKind::Response).add(&3u32);
        slave.send_packet().unwrap();
        assert_eq!(
            master.receive_packet(Some(Duration::from_secs(1))).unwrap(),
            MessageKind::Response
        );
        assert_eq!(master.read::<u32>().unwrap(), 3);
    }

    #[test]
    fn copied_endpoint_shares_buffer_and_position() {
        let (mut master, slave) = Channel::pair().unwrap();
        let mut copy = slave.clone();
        let mut original = slave;
        assert_eq!(original.handle_count(), 2);

        master.start_packet(MessageKind::Response).add(&1u32).add(&2u32);
        master.send_packet().unwrap();
        master.start_packet(MessageKind::Response).add(&3u32);
        master.send_packet().unwrap();

        original.receive_packet(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(original.read::<u32>().unwrap(), 1);
        assert_eq!(copy.read::<u32>().unwrap(), 2, "copy continues the same packet");

        copy.receive_packet(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(original.read::<u32>().unwrap(), 3);
    }

    #[test]
    fn silent_peer_times_out_and_poisons_channel() {
        let (mut master, _slave) = Channel::pair().unwrap();
        let err = master
            .receive_packet(Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err, ChannelError::SlaveTimeout(Duration::from_millis(20)));
        assert!(!master.good());

        master.send_empty(MessageKind::Ping).unwrap_err();
        assert_eq!(master.last_error().map(|e| e.code()), Some(ErrorCode::ChannelSlaveTimeout));
    }

    #[test]
    fn closed_peer_still_delivers_pending_packet() {
        let (mut master, mut slave) = Channel::pair().unwrap();
        slave.start_packet(MessageKind::Response).add(&9u32);
        slave.send_packet().unwrap();
        slave.close();
        drop(slave);

        assert_eq!(
            master.receive_packet(Some(Duration::from_secs(1))).unwrap(),
            MessageKind::Response
        );
        assert_eq!(master.read::<u32>().unwrap(), 9);
        assert_eq!(
            master.receive_packet(Some(Duration::from_secs(1))).unwrap_err(),
            ChannelError::SlaveCrashed
        );
    }

    #[test]
    fn slave_reports_master_gone() {
        let (master, mut slave) = Channel::pair().unwrap();
        drop(master);
        assert_eq!(slave.receive_packet(None).unwrap_err(), ChannelError::MasterGone);
    }

    #[test]
    fn reading_without_packet_is_not_fatal() {
        let (mut master, _slave) = Channel::pair().unwrap();
        let err = master.read::<u32>().unwrap_err();
        assert_eq!(err, ChannelError::NoPacket);
        assert!(!err.is_fatal());
        assert!(master.good());
    }

    #[test]
    fn writing_to_departed_peer_is_a_crash() {
        let (mut master, slave) = Channel::pair().unwrap();
        drop(slave);
        let err = master.send_empty(MessageKind::Ping).unwrap_err();
        assert_eq!(err, ChannelError::SlaveCrashed);
        assert_eq!(err.code(), ErrorCode::ChannelSlaveCrashed);
    }
}
