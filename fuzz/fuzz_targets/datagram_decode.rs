//! Fuzz target for the datagram packet reader
//!
//! # Strategy
//!
//! - Random bytes: arbitrary datagrams through the preamble check, header
//!   parse, varint decoding and per-family body decoding
//! - Both crypt policies: auto-crypt on exercises the AES decrypt path on
//!   whatever the command parser accepts
//!
//! # Invariants
//!
//! - Decoding completes quickly (varint bounds terminate every chain)
//! - Truncated, over-width and mangled inputs return errors
//! - NEVER panic on malformed datagrams

#![no_main]

use crosswire_proto::read_datagram_packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = read_datagram_packet(data, true);
    let _ = read_datagram_packet(data, false);
});
