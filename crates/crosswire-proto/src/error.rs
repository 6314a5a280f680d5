//! Framing and field errors.

use crosswire_crypto::CryptoError;
use thiserror::Error;

/// Errors produced while encoding or decoding wire packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Message type nibble outside the supported range 3..=8.
    #[error("message type {0} is not supported")]
    InvalidType(u8),

    /// Header flag nibble is not the protocol marker 8.
    #[error("header flag {0} is not supported")]
    InvalidFlag(u8),

    /// Declared body length exceeds the protocol maximum.
    #[error("body length {length} exceeds {max}")]
    LengthOverflow {
        /// Length that was requested.
        length: u64,
        /// Protocol maximum.
        max: u64,
    },

    /// Varint continuation chain exceeded its width bound.
    #[error("varint did not terminate within {max} bytes")]
    VarintOverflow {
        /// Width bound for this field.
        max: usize,
    },

    /// Datagram does not start with the `0x51 0x70` preamble.
    #[error("datagram preamble {found:02x?} does not match [51, 70]")]
    PreambleMismatch {
        /// First two bytes actually seen.
        found: [u8; 2],
    },

    /// Input ended before the declared packet length was satisfied.
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead {
        /// Bytes the packet declared.
        wanted: usize,
        /// Bytes actually available.
        got: usize,
    },

    /// A numeric field exceeds its wire cap at pack time.
    #[error("{field} value {value} exceeds {max}")]
    FieldOverflow {
        /// Field name.
        field: &'static str,
        /// Value that was supplied.
        value: u64,
        /// Wire cap for the field.
        max: u64,
    },

    /// A coded field holds a value outside its domain.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Value that was supplied.
        value: u8,
    },

    /// Payload encryption or decryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Transport-level I/O failure while reading a packet.
    #[error("i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
