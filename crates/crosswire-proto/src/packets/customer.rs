//! Customer packet: opaque pass-through, the payload is the whole body.

use crate::{
    error::FrameError,
    header::{FixedHeader, MessageType},
};

/// Application-defined packet forwarded without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerPacket {
    /// Fixed header.
    pub header: FixedHeader,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl CustomerPacket {
    /// New pass-through packet.
    pub fn new(payload: Vec<u8>) -> Self {
        let mut packet = Self::with_header(FixedHeader::new(MessageType::Customer));
        packet.payload = payload;
        packet
    }

    pub(crate) fn with_header(header: FixedHeader) -> Self {
        Self { header, payload: Vec::new() }
    }

    /// Encode the packet.
    pub fn pack(&mut self) -> Result<Vec<u8>, FrameError> {
        self.header.length = self.payload.len() as u64;
        let mut out = self.header.pack()?;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Take the full body as payload. The reader guarantees the body matches
    /// the declared length, so a truncated packet never yields a short
    /// payload here.
    pub fn unpack(&mut self, body: &[u8]) -> Result<(), FrameError> {
        self.payload = body.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut packet = CustomerPacket::new(b"opaque bytes".to_vec());
        let wire = packet.pack().unwrap();
        assert_eq!(wire[0], 0x78);

        let mut parsed = CustomerPacket::with_header(packet.header.clone());
        parsed.unpack(&wire[2..]).unwrap();
        assert_eq!(parsed.payload, b"opaque bytes");
    }
}
