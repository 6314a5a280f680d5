//! The five concrete packet shapes and the tagged union over them.
//!
//! Every packet packs to `fixed header | variable header | payload` and
//! unpacks from the body bytes that follow its fixed header. Command and
//! media packets optionally run payload AES according to their auto-crypt
//! flag; see the per-packet modules for field layouts.

mod av;
mod cmd;
mod customer;
mod file;
mod hb;

pub use av::{AvFormat, AvPacket};
pub use cmd::{CmdPacket, RpcKind};
pub use customer::CustomerPacket;
pub use file::FilePacket;
pub use hb::HbPacket;

use crate::{
    error::FrameError,
    header::{FixedHeader, MessageType, Protocol},
    varint::decode_varint,
};

/// Wire cap for 28-bit numeric fields: `2^28 - 1`.
pub const MAX_FIELD_VALUE: u64 = 268_435_455;

pub(crate) fn check_field(field: &'static str, value: u64) -> Result<(), FrameError> {
    if value > MAX_FIELD_VALUE {
        return Err(FrameError::FieldOverflow { field, value, max: MAX_FIELD_VALUE });
    }
    Ok(())
}

pub(crate) fn take_u8(body: &[u8], offset: &mut usize) -> Result<u8, FrameError> {
    let byte = *body
        .get(*offset)
        .ok_or(FrameError::ShortRead { wanted: *offset + 1, got: body.len() })?;
    *offset += 1;
    Ok(byte)
}

pub(crate) fn take_varint(
    body: &[u8],
    offset: &mut usize,
    max_bytes: usize,
) -> Result<u64, FrameError> {
    let (value, used) = decode_varint(&body[*offset..], max_bytes)?;
    *offset += used;
    Ok(value)
}

/// A decoded packet, tagged by family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Keep-alive.
    Heartbeat(HbPacket),
    /// Command request/response.
    Cmd(CmdPacket),
    /// Audio/video frame.
    Av(AvPacket),
    /// Opaque pass-through.
    Customer(CustomerPacket),
    /// File chunk.
    File(FilePacket),
}

impl Packet {
    /// Build an empty packet of the family selected by `header`, ready for
    /// [`Packet::unpack_body`]. `auto_crypt` is applied to command packets
    /// only; media packets keep their explicit per-packet default.
    pub fn from_header(header: FixedHeader, auto_crypt: bool) -> Self {
        match header.message_type {
            MessageType::Heartbeat => Self::Heartbeat(HbPacket::with_header(header)),
            MessageType::CmdBinary | MessageType::CmdJson => {
                let mut cmd = CmdPacket::with_header(header);
                cmd.auto_crypt = auto_crypt;
                Self::Cmd(cmd)
            }
            MessageType::Av => Self::Av(AvPacket::with_header(header)),
            MessageType::Customer => Self::Customer(CustomerPacket::with_header(header)),
            MessageType::File => Self::File(FilePacket::with_header(header)),
        }
    }

    /// Decode the body bytes (variable header + payload) into this packet.
    pub fn unpack_body(&mut self, body: &[u8]) -> Result<(), FrameError> {
        match self {
            Self::Heartbeat(p) => p.unpack(body),
            Self::Cmd(p) => p.unpack(body),
            Self::Av(p) => p.unpack(body),
            Self::Customer(p) => p.unpack(body),
            Self::File(p) => p.unpack(body),
        }
    }

    /// Encode the whole packet, fixed header included.
    pub fn pack(&mut self) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Heartbeat(p) => p.pack(),
            Self::Cmd(p) => p.pack(),
            Self::Av(p) => p.pack(),
            Self::Customer(p) => p.pack(),
            Self::File(p) => p.pack(),
        }
    }

    /// Shared fixed header.
    pub fn header(&self) -> &FixedHeader {
        match self {
            Self::Heartbeat(p) => &p.header,
            Self::Cmd(p) => &p.header,
            Self::Av(p) => &p.header,
            Self::Customer(p) => &p.header,
            Self::File(p) => &p.header,
        }
    }

    /// Shared fixed header, mutable.
    pub fn header_mut(&mut self) -> &mut FixedHeader {
        match self {
            Self::Heartbeat(p) => &mut p.header,
            Self::Cmd(p) => &mut p.header,
            Self::Av(p) => &mut p.header,
            Self::Customer(p) => &mut p.header,
            Self::File(p) => &mut p.header,
        }
    }

    /// Select stream or datagram framing for the next [`Packet::pack`].
    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.header_mut().protocol = protocol;
    }

    /// Family tag for log lines.
    pub fn family(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => "HB",
            Self::Cmd(_) => "CMD",
            Self::Av(_) => "AV",
            Self::Customer(_) => "CUSTOMER",
            Self::File(_) => "FILE",
        }
    }
}
