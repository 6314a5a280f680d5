//! Crosswire shared runtime.
//!
//! Everything the TCP/TLS and UDP peers have in common:
//!
//! - [`Conn`]: the connection capability, with [`StreamConn`] and
//!   [`DatagramConn`] implementations
//! - [`Service`]: the command registry consulted during dispatch
//! - [`Dispatcher`]: family demux, registered callbacks, default handlers
//! - [`PendingCalls`]: the rendezvous table behind synchronous invokes
//! - [`SessionTable`]: bounded map of UDP virtual connections
//! - [`SeqAllocator`]: the global `cmd_seq` source
//! - [`Message`]: the pluggable payload codec (binary / JSON)
//!
//! Transport-specific servers and clients live in their own crates and
//! compose these pieces.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod codec;
mod conn;
mod dispatch;
mod error;
mod pending;
mod seq;
mod service;
mod sess;

pub use codec::{CodecError, Encoding, Message};
pub use conn::{
    CloseHook, Conn, ConnRef, ConnState, DatagramConn, INBOUND_CAPACITY, OutboundDatagram,
    StreamConn, Transport, UserAttr, send_packet,
};
pub use dispatch::{
    CMD_ID_NOT_REGISTERED, Callbacks, Dispatcher, FamilyCallback, PacketOverride, PreHook,
    decode_packet, invoke_async, write_response,
};
pub use error::{DispatchError, NetError};
pub use pending::{PendingCalls, PendingSlot};
pub use seq::{SEQ_WRAP, SeqAllocator, next_cmd_seq};
pub use service::{
    CmdHandler, DecodeFn, Service, ServiceDesc, UserData, decode_response, handle_request,
    ignore_packet,
};
pub use sess::{SessionError, SessionTable};
