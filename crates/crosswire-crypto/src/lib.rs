//! Crosswire cryptographic primitives.
//!
//! Payload encryption for the crosswire wire protocol. Two building blocks:
//!
//! - [`encrypt`] / [`decrypt`]: AES in CBC or CFB mode over a 32-byte
//!   key/IV pair, selected by [`CipherSuite`]. CBC pads to 16-byte blocks
//!   (PKCS#7); CFB preserves the payload length.
//! - [`command_key`] / [`media_key`]: per-packet key derivation. Every
//!   packet gets a fresh key computed from its own header fields — keys are
//!   never bound to a connection.
//!
//! The derived key doubles as the IV. Both are the 32 lowercase-hex ASCII
//! bytes of an MD5 digest; the block layers consume only the prefix they
//! need (16/24/32 key bytes, 16 IV bytes).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod cipher;
mod derive;

pub use cipher::{CipherSuite, CryptoError, decrypt, encrypt};
pub use derive::{DERIVED_LEN, KEY_PREFIX, command_key, media_key};
