//! Per-packet key derivation.
//!
//! Command and media packets each derive a fresh key from their own header
//! fields, so a captured key unlocks exactly one packet. The derivation is
//! `lowercase_hex(md5(prefix || suffix))` where the suffix is a formatted
//! rendering of the header fields. The 32 hex ASCII bytes serve as both key
//! and IV material for [`crate::encrypt`] / [`crate::decrypt`].

use md5::{Digest, Md5};

/// Fixed ASCII prefix for all derived keys (wire-compatibility constant).
pub const KEY_PREFIX: &[u8] = b"P2p0r1p8c0622";

/// Length of the derived key/IV material: 16 MD5 bytes as lowercase hex.
pub const DERIVED_LEN: usize = 32;

fn derive(suffix: &str) -> [u8; DERIVED_LEN] {
    let mut hasher = Md5::new();
    hasher.update(KEY_PREFIX);
    hasher.update(suffix.as_bytes());
    let digest = hasher.finalize();

    let mut out = [0u8; DERIVED_LEN];
    // 16 digest bytes always produce exactly 32 hex characters
    let _ = hex::encode_to_slice(digest, &mut out);
    out
}

/// Derive the key for a command packet from `(cmd_id, cmd_seq, rpc_kind)`.
///
/// `rpc_kind` is the wire value (0 request, 1 response); request and
/// response directions encrypt under different keys.
pub fn command_key(cmd_id: u64, cmd_seq: u64, rpc_kind: u8) -> [u8; DERIVED_LEN] {
    derive(&format!(",ID:{cmd_id}-SEQ:{cmd_seq}-RPC:{rpc_kind}"))
}

/// Derive the key for a media packet from `(av_seq, timestamp, av_channel)`.
pub fn media_key(av_seq: u64, timestamp: u64, av_channel: u64) -> [u8; DERIVED_LEN] {
    derive(&format!(",AVSeq:{av_seq}-TT:{timestamp}-AVChannel:{av_channel}"))
}
