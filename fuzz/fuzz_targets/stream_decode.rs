//! Fuzz target for the stream packet reader
//!
//! # Strategy
//!
//! - Random bytes: arbitrary streams through the type/flag split, bounded
//!   length varint and per-family body decoding
//! - Short input: the reader must report a short read, not block or panic
//!
//! # Invariants
//!
//! - At most one packet's worth of bytes is consumed
//! - Truncated bodies surface as errors
//! - NEVER panic on malformed streams

#![no_main]

use crosswire_proto::read_stream_packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    let mut stream = data;
    let _ = runtime.block_on(read_stream_packet(&mut stream, true));
});
