//! Crosswire client transports.
//!
//! [`TcpClient`] dials `tcp://` or `tls://` endpoints and keeps the
//! connection alive with a reconnect loop and automatic heartbeats;
//! [`UdpClient`] speaks the datagram framing over a single connected
//! socket. Both expose the same calling surface: synchronous
//! `invoke` (request plus decoded response), fire-and-forget
//! `invoke_async`, and the callback set from [`crosswire_core`] for
//! server-pushed packets.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod invoke;
mod tcp;
mod tls;
mod udp;

pub use invoke::InvokeError;
pub use tcp::{MIN_HEARTBEAT, MIN_RETRY, OnConnected, TcpClient, TcpClientConfig};
pub use tls::insecure_tls_config;
pub use udp::{
    DEFAULT_UDP_HEARTBEAT, DEFAULT_UDP_READ_TIMEOUT, OnUdpConnected, UdpClient, UdpClientConfig,
};
