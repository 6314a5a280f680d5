//! Heartbeat packet: a bare fixed header with zero length.

use crate::{
    error::FrameError,
    header::{FixedHeader, MessageType},
};

/// Empty keep-alive packet. On a TCP wire this is exactly `[0x38, 0x00]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbPacket {
    /// Fixed header; `length` is always zero.
    pub header: FixedHeader,
}

impl HbPacket {
    /// New heartbeat.
    pub fn new() -> Self {
        Self { header: FixedHeader::new(MessageType::Heartbeat) }
    }

    pub(crate) fn with_header(header: FixedHeader) -> Self {
        Self { header }
    }

    /// Encode the packet.
    pub fn pack(&mut self) -> Result<Vec<u8>, FrameError> {
        self.header.length = 0;
        self.header.pack()
    }

    pub(crate) fn unpack(&mut self, _body: &[u8]) -> Result<(), FrameError> {
        Ok(())
    }
}

impl Default for HbPacket {
    fn default() -> Self {
        Self::new()
    }
}
