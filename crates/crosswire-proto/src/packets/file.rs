//! File chunk packet: a byte range of a transfer identified by `file_id`.
//!
//! Variable header layout:
//!
//! ```text
//! file_id:varint(≤9B) | offset:varint(≤9B) | encrypt_type : 1B | encrypt_length:varint(≤9B)
//! ```
//!
//! The runtime never applies payload encryption to file chunks; the
//! `encrypt_type` / `encrypt_length` fields describe what the application
//! layer did to the bytes.

use crate::{
    error::FrameError,
    header::{FixedHeader, MessageType},
    packets::{take_u8, take_varint},
    varint::{MAX_VARINT_64, encode_varint},
};

/// Bulk byte-range transfer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePacket {
    /// Fixed header.
    pub header: FixedHeader,
    /// Identifier of the file this chunk belongs to.
    pub file_id: u64,
    /// Offset of the payload relative to the start of the file.
    pub offset: u64,
    /// Application-level encryption marker; opaque to the runtime.
    pub encrypt_type: u8,
    /// Length of the encrypted span; zero means the whole payload.
    pub encrypt_length: u64,
    /// Variable-header bytes as emitted or consumed, for diagnostics.
    pub var_header: Vec<u8>,
    /// Chunk payload.
    pub payload: Vec<u8>,
}

impl FilePacket {
    /// New chunk for `file_id` at `offset`.
    pub fn new(file_id: u64, offset: u64) -> Self {
        let mut packet = Self::with_header(FixedHeader::new(MessageType::File));
        packet.file_id = file_id;
        packet.offset = offset;
        packet
    }

    pub(crate) fn with_header(header: FixedHeader) -> Self {
        Self {
            header,
            file_id: 0,
            offset: 0,
            encrypt_type: 0,
            encrypt_length: 0,
            var_header: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Encode the packet.
    pub fn pack(&mut self) -> Result<Vec<u8>, FrameError> {
        let mut var = Vec::with_capacity(20);
        encode_varint(self.file_id, &mut var);
        encode_varint(self.offset, &mut var);
        var.push(self.encrypt_type);
        encode_varint(self.encrypt_length, &mut var);

        self.header.length = (var.len() + self.payload.len()) as u64;
        let mut out = self.header.pack()?;
        out.extend_from_slice(&var);
        out.extend_from_slice(&self.payload);
        self.var_header = var;
        Ok(out)
    }

    /// Decode the body into this packet.
    pub fn unpack(&mut self, body: &[u8]) -> Result<(), FrameError> {
        let mut offset = 0;
        self.file_id = take_varint(body, &mut offset, MAX_VARINT_64)?;
        self.offset = take_varint(body, &mut offset, MAX_VARINT_64)?;
        self.encrypt_type = take_u8(body, &mut offset)?;
        self.encrypt_length = take_varint(body, &mut offset, MAX_VARINT_64)?;

        self.var_header = body[..offset].to_vec();
        self.payload = body[offset..].to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_wide_fields() {
        // largest values a 9-byte varint can carry
        let mut chunk = FilePacket::new((1 << 63) - 1, (1 << 62) + 5);
        chunk.encrypt_type = 3;
        chunk.encrypt_length = 16;
        chunk.payload = vec![7u8; 64];
        let wire = chunk.pack().unwrap();

        // 9-byte file_id and offset varints push the length past one byte
        let (message_type, _) = (wire[0] >> 4, wire[0] & 0x0F);
        assert_eq!(message_type, MessageType::File.as_u8());

        let (header, used) = FixedHeader::unpack(wire[0], &wire[1..]).unwrap();
        let mut parsed = FilePacket::with_header(header);
        parsed.unpack(&wire[1 + used..]).unwrap();

        assert_eq!(parsed.file_id, (1 << 63) - 1);
        assert_eq!(parsed.offset, (1 << 62) + 5);
        assert_eq!(parsed.encrypt_type, 3);
        assert_eq!(parsed.encrypt_length, 16);
        assert_eq!(parsed.payload, chunk.payload);
    }

    #[test]
    fn truncated_var_header_is_short_read() {
        let mut chunk = FilePacket::new(1, 2);
        let wire = chunk.pack().unwrap();

        let mut parsed = FilePacket::with_header(chunk.header.clone());
        // cut inside the var header
        assert!(matches!(
            parsed.unpack(&wire[2..3]),
            Err(FrameError::ShortRead { .. })
        ));
    }
}
