//! Packet Protocol: typed fields framed into discrete messages.
//!
//! Every packet is `[kind: u32 LE][payload length: u32 LE][payload]`. Fields
//! carry no type tag; each message kind has a fixed field order both sides
//! follow (see [`MessageKind`]).

pub mod assembler;
pub mod kind;
pub mod packet;

pub use assembler::FrameAssembler;
pub use kind::{KindFamily, MessageKind};
pub use packet::{Decode, Encode, Packet, PacketError, PacketReader, PacketWriter, HEADER_BYTES};
