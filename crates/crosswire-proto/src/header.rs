//! Fixed header: the one or two bytes of type/flag plus a varint length that
//! prefix every packet, and the UDP preamble that precedes them on datagram
//! transports.

use crate::{
    error::FrameError,
    varint::{MAX_VARINT_28, decode_varint, encode_varint},
};

/// Protocol flag nibble; constant in the current dialect.
pub const PROTOCOL_FLAG: u8 = 8;

/// Maximum body length (variable header + payload): `2^28 - 1`.
///
/// This is also the largest value a 4-byte varint can carry, so the decode
/// bound enforces it for free.
pub const MAX_BODY_LEN: u64 = 268_435_455;

/// Two-byte preamble prepended to every datagram.
pub const UDP_PREAMBLE: [u8; 2] = [0x51, 0x70];

/// Maximum datagram size, preamble included.
pub const MAX_DATAGRAM: usize = 1500;

/// Wire message families, carried in the high nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Empty keep-alive packet.
    Heartbeat = 3,
    /// Command packet with binary-encoded payload.
    CmdBinary = 4,
    /// Command packet with JSON-encoded payload.
    CmdJson = 5,
    /// Audio/video frame packet.
    Av = 6,
    /// Opaque pass-through payload.
    Customer = 7,
    /// Bulk byte-range file transfer packet.
    File = 8,
}

impl MessageType {
    /// Parse a type nibble.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::CmdBinary),
            5 => Ok(Self::CmdJson),
            6 => Ok(Self::Av),
            7 => Ok(Self::Customer),
            8 => Ok(Self::File),
            other => Err(FrameError::InvalidType(other)),
        }
    }

    /// Wire value of this type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the two command encodings.
    pub fn is_command(self) -> bool {
        matches!(self, Self::CmdBinary | Self::CmdJson)
    }
}

/// Transport framing rule. Not on the wire itself; governs whether the UDP
/// preamble is emitted ahead of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Stream framing (TCP or TLS).
    #[default]
    Tcp,
    /// Datagram framing (UDP), preamble included.
    Udp,
}

/// Fixed header present on every packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedHeader {
    /// Message family.
    pub message_type: MessageType,
    /// Flag nibble; must be [`PROTOCOL_FLAG`].
    pub flag: u8,
    /// Byte count of variable header plus payload.
    pub length: u64,
    /// Framing rule for the transport this header travels on.
    pub protocol: Protocol,
    /// Exact bytes consumed or emitted for this header, kept for diagnostics.
    pub raw: Vec<u8>,
}

impl FixedHeader {
    /// New header for `message_type` with zero length and TCP framing.
    pub fn new(message_type: MessageType) -> Self {
        Self { message_type, flag: PROTOCOL_FLAG, length: 0, protocol: Protocol::Tcp, raw: Vec::new() }
    }

    /// Split and validate the first wire byte into type and flag.
    pub fn split_type_flag(byte: u8) -> Result<(MessageType, u8), FrameError> {
        let message_type = MessageType::from_u8(byte >> 4)?;
        let flag = byte & 0x0F;
        if flag != PROTOCOL_FLAG {
            return Err(FrameError::InvalidFlag(flag));
        }
        Ok((message_type, flag))
    }

    /// Encode the header, storing the emitted bytes in `raw`.
    pub fn pack(&mut self) -> Result<Vec<u8>, FrameError> {
        if self.flag != PROTOCOL_FLAG {
            return Err(FrameError::InvalidFlag(self.flag));
        }
        if self.length > MAX_BODY_LEN {
            return Err(FrameError::LengthOverflow { length: self.length, max: MAX_BODY_LEN });
        }

        let mut out = Vec::with_capacity(8);
        if self.protocol == Protocol::Udp {
            out.extend_from_slice(&UDP_PREAMBLE);
        }
        out.push((self.message_type.as_u8() << 4) | (self.flag & 0x0F));
        encode_varint(self.length, &mut out);

        self.raw = out.clone();
        Ok(out)
    }

    /// Decode a header from `type_flag` plus the bytes that follow it.
    ///
    /// Returns the header and the number of `rest` bytes consumed by the
    /// length varint. The UDP preamble, if any, must already have been
    /// stripped by the datagram reader.
    pub fn unpack(type_flag: u8, rest: &[u8]) -> Result<(Self, usize), FrameError> {
        let (message_type, flag) = Self::split_type_flag(type_flag)?;
        let (length, used) = decode_varint(rest, MAX_VARINT_28)?;

        let mut raw = Vec::with_capacity(1 + used);
        raw.push(type_flag);
        raw.extend_from_slice(&rest[..used]);

        Ok((Self { message_type, flag, length, protocol: Protocol::Tcp, raw }, used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_header_is_two_bytes() {
        let mut header = FixedHeader::new(MessageType::Heartbeat);
        assert_eq!(header.pack().unwrap(), [0x38, 0x00]);
    }

    #[test]
    fn udp_framing_prepends_preamble() {
        let mut header = FixedHeader::new(MessageType::Heartbeat);
        header.protocol = Protocol::Udp;
        assert_eq!(header.pack().unwrap(), [0x51, 0x70, 0x38, 0x00]);
    }

    #[test]
    fn round_trip_with_multi_byte_length() {
        let mut header = FixedHeader::new(MessageType::Av);
        header.length = 300;
        let bytes = header.pack().unwrap();

        let (parsed, used) = FixedHeader::unpack(bytes[0], &bytes[1..]).unwrap();
        assert_eq!(used, bytes.len() - 1);
        assert_eq!(parsed.message_type, MessageType::Av);
        assert_eq!(parsed.length, 300);
        assert_eq!(parsed.raw, bytes);
    }

    #[test]
    fn type_nibble_out_of_range_rejected() {
        for nibble in [0u8, 1, 2, 9, 0x0F] {
            let byte = (nibble << 4) | PROTOCOL_FLAG;
            assert_eq!(
                FixedHeader::split_type_flag(byte),
                Err(FrameError::InvalidType(nibble))
            );
        }
    }

    #[test]
    fn flag_nibble_must_be_eight() {
        for flag in (0u8..16).filter(|&f| f != PROTOCOL_FLAG) {
            let byte = (MessageType::Heartbeat.as_u8() << 4) | flag;
            assert_eq!(FixedHeader::split_type_flag(byte), Err(FrameError::InvalidFlag(flag)));
        }
    }

    #[test]
    fn oversized_length_rejected_at_pack() {
        let mut header = FixedHeader::new(MessageType::File);
        header.length = MAX_BODY_LEN + 1;
        assert_eq!(
            header.pack(),
            Err(FrameError::LengthOverflow { length: MAX_BODY_LEN + 1, max: MAX_BODY_LEN })
        );
    }

    #[test]
    fn bad_flag_rejected_at_pack() {
        let mut header = FixedHeader::new(MessageType::File);
        header.flag = 3;
        assert_eq!(header.pack(), Err(FrameError::InvalidFlag(3)));
    }
}
