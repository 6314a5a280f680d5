//! Crosswire wire framing and packet codec.
//!
//! A self-describing binary format multiplexing five message families over
//! stream (TCP/TLS) and datagram (UDP) transports:
//!
//! | Family | Type | Contents |
//! |---|---|---|
//! | [`HbPacket`] | 3 | empty keep-alive |
//! | [`CmdPacket`] | 4/5 | command request/response, binary or JSON payload |
//! | [`AvPacket`] | 6 | audio/video frame |
//! | [`CustomerPacket`] | 7 | opaque pass-through |
//! | [`FilePacket`] | 8 | file byte-range chunk |
//!
//! Stream framing is `type_flag:1B | length:varint | body`; datagram framing
//! prepends the `0x51 0x70` preamble and carries at most 1500 bytes. Command
//! and media payloads can be AES-encrypted under per-packet derived keys
//! (see [`crosswire_crypto`]).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod header;
mod packets;
mod reader;
mod varint;

pub use crosswire_crypto::CipherSuite;
pub use error::FrameError;
pub use header::{
    FixedHeader, MAX_BODY_LEN, MAX_DATAGRAM, MessageType, PROTOCOL_FLAG, Protocol, UDP_PREAMBLE,
};
pub use packets::{
    AvFormat, AvPacket, CmdPacket, CustomerPacket, FilePacket, HbPacket, MAX_FIELD_VALUE, Packet,
    RpcKind,
};
pub use reader::{read_datagram_packet, read_stream_packet};
pub use varint::{MAX_VARINT_28, MAX_VARINT_64, decode_varint, encode_varint};
