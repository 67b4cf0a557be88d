use super::kind::MessageKind;
use super::packet::{Packet, PacketError, HEADER_BYTES};

/// Reassembles packets from arbitrarily chunked transport reads.
///
/// Bytes beyond the packet being returned stay buffered for the next call,
/// so chunk boundaries never leak into packet boundaries.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    start: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        if self.start > 0 && self.start * 2 >= self.buffer.len() {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Buffered bytes not yet returned as part of a packet.
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.start
    }

    /// Bytes still missing before the next packet is complete, once its header is known.
    pub fn missing(&self) -> Option<usize> {
        let available = self.pending();
        if available < HEADER_BYTES {
            return None;
        }
        let total = HEADER_BYTES + self.payload_len();
        Some(total.saturating_sub(available))
    }

    /// Pop the next complete packet, if one has fully arrived.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, PacketError> {
        if self.pending() < HEADER_BYTES {
            return Ok(None);
        }
        let head = &self.buffer[self.start..];
        let raw_kind = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let kind = MessageKind::from_u32(raw_kind).ok_or(PacketError::UnknownKind(raw_kind))?;
        let payload_len = self.payload_len();
        if self.pending() < HEADER_BYTES + payload_len {
            return Ok(None);
        }

        let body = self.start + HEADER_BYTES;
        let payload = self.buffer[body..body + payload_len].to_vec();
        self.start = body + payload_len;
        if self.start == self.buffer.len() {
            self.buffer.clear();
            self.start = 0;
        }
        Ok(Some(Packet::new(kind, payload)))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.start = 0;
    }

    fn payload_len(&self) -> usize {
        let head = &self.buffer[self.start + 4..self.start + HEADER_BYTES];
        u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize
    }
}
