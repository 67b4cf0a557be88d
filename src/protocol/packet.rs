use super::kind::MessageKind;
use thiserror::Error;

/// `kind` (4) + `payload length` (4), both little-endian.
pub const HEADER_BYTES: usize = 8;

/// Smallest step the outgoing buffer grows by.
pub const GROWTH_INCREMENT: usize = 1024;

/// Errors from building or parsing a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("read past the end of the packet: needed {needed} bytes, {remaining} left")]
    EndOfPacket { needed: usize, remaining: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid bool byte {0}")]
    InvalidBool(u8),

    #[error("payload of {0} bytes does not fit the length field")]
    TooLarge(usize),

    #[error("no packet was started")]
    NotStarted,

    #[error("invalid {field} value {value}")]
    InvalidEnum { field: &'static str, value: u32 },
}

/// A field type with a fixed encoding.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);

    /// Bytes `encode` will append.
    fn encoded_len(&self) -> usize;
}

/// A field type readable from the head of a packet.
pub trait Decode: Sized {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, PacketError>;
}

macro_rules! le_field {
    ($($ty:ty),+) => {$(
        impl Encode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn encoded_len(&self) -> usize {
                std::mem::size_of::<$ty>()
            }
        }

        impl Decode for $ty {
            fn decode(reader: &mut PacketReader<'_>) -> Result<Self, PacketError> {
                const LEN: usize = std::mem::size_of::<$ty>();
                let mut bytes = [0u8; LEN];
                bytes.copy_from_slice(reader.read_raw(LEN)?);
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }
    )+};
}

// u64 has no dedicated wire type; its 8 little-endian bytes travel as a raw block.
le_field!(i32, u32, f32, f64, u64);

impl Encode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn encoded_len(&self) -> usize {
        1
    }
}

impl Decode for bool {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        match reader.read_raw(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PacketError::InvalidBool(other)),
        }
    }
}

impl Encode for str {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode(out);
        out.extend_from_slice(self.as_bytes());
    }

    fn encoded_len(&self) -> usize {
        4 + self.len()
    }
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_str().encode(out);
    }

    fn encoded_len(&self) -> usize {
        self.as_str().encoded_len()
    }
}

impl Decode for String {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        let len = u32::decode(reader)? as usize;
        let bytes = reader.read_raw(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| PacketError::InvalidUtf8)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, out: &mut Vec<u8>) {
        (**self).encode(out);
    }

    fn encoded_len(&self) -> usize {
        (**self).encoded_len()
    }
}

/// Builds one outgoing packet: header first, fields appended in call order.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
    kind: Option<MessageKind>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any unsent packet and start a new one.
    pub fn start(&mut self, kind: MessageKind) -> &mut Self {
        self.buffer.clear();
        self.reserve(HEADER_BYTES);
        kind.as_u32().encode(&mut self.buffer);
        0u32.encode(&mut self.buffer);
        self.kind = Some(kind);
        self
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.kind
    }

    pub fn add<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        self.reserve(value.encoded_len());
        value.encode(&mut self.buffer);
        self
    }

    /// Append bytes with no length prefix; the reader must know the size.
    pub fn add_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.reserve(bytes.len());
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub fn add_u32_block(&mut self, values: &[u32]) -> &mut Self {
        self.reserve(values.len() * 4);
        for value in values {
            value.encode(&mut self.buffer);
        }
        self
    }

    pub fn add_f32_block(&mut self, values: &[f32]) -> &mut Self {
        self.reserve(values.len() * 4);
        for value in values {
            value.encode(&mut self.buffer);
        }
        self
    }

    pub fn payload_len(&self) -> usize {
        self.buffer.len().saturating_sub(HEADER_BYTES)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Patch the length field and return the wire bytes of the packet.
    pub fn finish(&mut self) -> Result<&[u8], PacketError> {
        if self.kind.is_none() {
            return Err(PacketError::NotStarted);
        }
        let payload_len = self.payload_len();
        let len = u32::try_from(payload_len).map_err(|_| PacketError::TooLarge(payload_len))?;
        self.buffer[4..HEADER_BYTES].copy_from_slice(&len.to_le_bytes());
        Ok(&self.buffer)
    }

    /// Forget the packet once it has been flushed.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.kind = None;
    }

    fn reserve(&mut self, additional: usize) {
        let len = self.buffer.len();
        let capacity = self.buffer.capacity();
        if capacity - len >= additional {
            return;
        }
        let target = (len + additional)
            .max(capacity.saturating_mul(2))
            .max(capacity + GROWTH_INCREMENT);
        self.buffer.reserve_exact(target - len);
    }
}

/// A received packet plus the read position of its consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    kind: MessageKind,
    payload: Vec<u8>,
    cursor: usize,
}

impl Packet {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            cursor: 0,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn read<T: Decode>(&mut self) -> Result<T, PacketError> {
        let mut reader = PacketReader::new(&self.payload[self.cursor..]);
        let value = T::decode(&mut reader)?;
        self.cursor += reader.position();
        Ok(value)
    }

    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, PacketError> {
        let mut reader = PacketReader::new(&self.payload[self.cursor..]);
        let bytes = reader.read_raw(len)?.to_vec();
        self.cursor += len;
        Ok(bytes)
    }

    pub fn read_u32_block(&mut self, count: usize) -> Result<Vec<u32>, PacketError> {
        let mut reader = PacketReader::new(&self.payload[self.cursor..]);
        let values = reader.read_u32_block(count)?;
        self.cursor += reader.position();
        Ok(values)
    }

    pub fn read_f32_block(&mut self, count: usize) -> Result<Vec<f32>, PacketError> {
        let mut reader = PacketReader::new(&self.payload[self.cursor..]);
        let values = reader.read_f32_block(count)?;
        self.cursor += reader.position();
        Ok(values)
    }

    pub fn is_at_end(&self) -> bool {
        self.cursor >= self.payload.len()
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }
}

/// Cursor over one packet payload. Reads never go past its end.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read<T: Decode>(&mut self) -> Result<T, PacketError> {
        T::decode(self)
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], PacketError> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(PacketError::EndOfPacket {
                needed: len,
                remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u32_block(&mut self, count: usize) -> Result<Vec<u32>, PacketError> {
        let bytes = self.read_raw(count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn read_f32_block(&mut self, count: usize) -> Result<Vec<f32>, PacketError> {
        let bytes = self.read_raw(count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }
}
