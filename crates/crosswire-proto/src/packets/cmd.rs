//! Command packet: the request/response carrier.
//!
//! Variable header layout:
//!
//! ```text
//! cmd_seq:varint | cmd_id:varint | (enc_type << 2) | rpc_kind : 1B | code:varint (RESP only)
//! ```
//!
//! With auto-crypt on (the default), the payload is encrypted at pack time
//! and decrypted at unpack time under a key derived from
//! `(cmd_id, cmd_seq, rpc_kind)` — every packet gets its own key.

use crosswire_crypto::{CipherSuite, DERIVED_LEN, command_key, decrypt, encrypt};

use crate::{
    error::FrameError,
    header::{FixedHeader, MessageType},
    packets::{check_field, take_u8, take_varint},
    varint::{MAX_VARINT_28, encode_varint},
};

/// Direction of a command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcKind {
    /// Request, expects a response carrying the same `cmd_seq`.
    Request = 0,
    /// Response; the variable header additionally carries `code`.
    Response = 1,
}

impl RpcKind {
    /// Parse the two-bit wire value.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(FrameError::InvalidField { field: "rpc_type", value: other }),
        }
    }

    /// Wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Command request/response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdPacket {
    /// Fixed header; the message type selects binary or JSON payloads.
    pub header: FixedHeader,
    /// Whether pack/unpack runs payload AES automatically.
    pub auto_crypt: bool,
    /// Correlation sequence number, unique per in-flight call.
    pub cmd_seq: u64,
    /// Command identifier, the service-registry key.
    pub cmd_id: u64,
    /// Human name of the command, resolved during dispatch. Empty on the wire.
    pub cmd_name: String,
    /// Payload cipher suite.
    pub suite: CipherSuite,
    /// Request or response.
    pub rpc_kind: RpcKind,
    /// Result code; present on the wire only for responses. Zero is success.
    pub code: u64,
    /// Variable-header bytes as emitted or consumed, for diagnostics.
    pub var_header: Vec<u8>,
    /// Plaintext payload.
    pub payload: Vec<u8>,
    /// Payload bytes exactly as they appeared on the wire.
    pub raw_payload: Vec<u8>,
}

impl CmdPacket {
    /// New request packet. `message_type` must be one of the two command
    /// encodings.
    pub fn new(message_type: MessageType) -> Self {
        debug_assert!(message_type.is_command(), "CmdPacket requires a command message type");
        Self::with_header(FixedHeader::new(message_type))
    }

    pub(crate) fn with_header(header: FixedHeader) -> Self {
        Self {
            header,
            auto_crypt: true,
            cmd_seq: 0,
            cmd_id: 0,
            cmd_name: String::new(),
            suite: CipherSuite::None,
            rpc_kind: RpcKind::Request,
            code: 0,
            var_header: Vec::new(),
            payload: Vec::new(),
            raw_payload: Vec::new(),
        }
    }

    /// Key/IV material derived from this packet's correlation fields.
    pub fn derived_key(&self) -> [u8; DERIVED_LEN] {
        command_key(self.cmd_id, self.cmd_seq, self.rpc_kind.as_u8())
    }

    /// Encode the packet. The stored plaintext payload is left untouched;
    /// encryption happens into the output buffer.
    pub fn pack(&mut self) -> Result<Vec<u8>, FrameError> {
        check_field("cmd_seq", self.cmd_seq)?;
        check_field("cmd_id", self.cmd_id)?;
        check_field("code", self.code)?;

        let mut var = Vec::with_capacity(12);
        encode_varint(self.cmd_seq, &mut var);
        encode_varint(self.cmd_id, &mut var);
        var.push((self.suite.as_u8() << 2) | self.rpc_kind.as_u8());
        if self.rpc_kind == RpcKind::Response {
            encode_varint(self.code, &mut var);
        }

        let body = if !self.payload.is_empty() && self.auto_crypt {
            let key = self.derived_key();
            encrypt(self.suite, &key, &key, &self.payload)?
        } else {
            self.payload.clone()
        };

        self.header.length = (var.len() + body.len()) as u64;
        let mut out = self.header.pack()?;
        out.extend_from_slice(&var);
        out.extend_from_slice(&body);
        self.var_header = var;
        Ok(out)
    }

    /// Decode the body (variable header + payload) into this packet.
    pub fn unpack(&mut self, body: &[u8]) -> Result<(), FrameError> {
        let mut offset = 0;
        self.cmd_seq = take_varint(body, &mut offset, MAX_VARINT_28)?;
        self.cmd_id = take_varint(body, &mut offset, MAX_VARINT_28)?;

        let packed = take_u8(body, &mut offset)?;
        self.suite = CipherSuite::from_u8(packed >> 2)
            .map_err(|_| FrameError::InvalidField { field: "enc_type", value: packed >> 2 })?;
        self.rpc_kind = RpcKind::from_u8(packed & 0x03)?;
        if self.rpc_kind == RpcKind::Response {
            self.code = take_varint(body, &mut offset, MAX_VARINT_28)?;
        }

        self.var_header = body[..offset].to_vec();
        self.raw_payload = body[offset..].to_vec();

        self.payload = if !self.raw_payload.is_empty() && self.auto_crypt {
            let key = self.derived_key();
            decrypt(self.suite, &key, &key, &self.raw_payload)?
        } else {
            self.raw_payload.clone()
        };
        Ok(())
    }
}
