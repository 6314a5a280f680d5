//! Opaque payload codec.
//!
//! The runtime never interprets command payloads; it only moves bytes. The
//! encode/decode pair is pluggable per message: anything `serde`-serialisable
//! is a [`Message`], and the packet's message type selects the encoding —
//! binary (bincode) for type 4, JSON for type 5.

use std::any::Any;

use crosswire_proto::MessageType;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Errors from payload encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialising a message failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Deserialising a payload failed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The packet's message type does not carry an encoded payload.
    #[error("message type {0} does not carry an encoded payload")]
    UnsupportedEncoding(u8),
}

/// Payload encoding selected by the packet's message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Compact binary encoding (message type 4).
    Binary,
    /// JSON encoding (message type 5).
    Json,
}

impl Encoding {
    /// Encoding for a command message type.
    pub fn for_message_type(message_type: MessageType) -> Result<Self, CodecError> {
        match message_type {
            MessageType::CmdBinary => Ok(Self::Binary),
            MessageType::CmdJson => Ok(Self::Json),
            other => Err(CodecError::UnsupportedEncoding(other.as_u8())),
        }
    }
}

/// An application message that can cross the wire in either encoding.
///
/// Blanket-implemented for every `serde` type, so handlers work with plain
/// structs. The `Any` plumbing lets the erased dispatch layer hand decoded
/// messages back to typed callers.
pub trait Message: Any + Send + Sync {
    /// Replace `self` with the message decoded from `bytes`.
    fn merge(&mut self, encoding: Encoding, bytes: &[u8]) -> Result<(), CodecError>;

    /// Encode `self` under `encoding`.
    fn encode(&self, encoding: Encoding) -> Result<Vec<u8>, CodecError>;

    /// Borrow as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Consume into `Any` for owned downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl std::fmt::Debug for dyn Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Message")
    }
}

impl<T> Message for T
where
    T: Serialize + DeserializeOwned + Any + Send + Sync,
{
    fn merge(&mut self, encoding: Encoding, bytes: &[u8]) -> Result<(), CodecError> {
        *self = match encoding {
            Encoding::Binary => {
                bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))?
            }
            Encoding::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?
            }
        };
        Ok(())
    }

    fn encode(&self, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
        match encoding {
            Encoding::Binary => {
                bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
            }
            Encoding::Json => {
                serde_json::to_vec(self).map_err(|e| CodecError::Encode(e.to_string()))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
