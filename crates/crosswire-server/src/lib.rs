//! Crosswire server transports.
//!
//! [`TcpServer`] accepts `tcp://` or `tls://` streams and runs one receive
//! loop per connection; [`UdpServer`] multiplexes a single socket into
//! per-remote virtual connections behind a bounded session table. Both
//! dispatch through [`crosswire_core::Dispatcher`] with the registered
//! service table and callback set.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod tcp;
mod tls;
mod udp;

use std::sync::Arc;

use crosswire_core::{Conn, ConnRef, NetError};
use thiserror::Error;

pub use tcp::{TcpServer, TcpServerConfig};
pub use tls::server_tls_config;
pub use udp::{
    ACCEPT_CAPACITY, DEFAULT_MAX_SESSIONS, EVICT_CAPACITY, OUTBOUND_CAPACITY, UdpServer,
    UdpServerConfig,
};

/// Errors from server construction and serving.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid bind URL, missing TLS material, unreadable PEM files.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level failure binding or accepting.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection-level failure.
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Hook invoked when a connection is accepted.
pub type ConnectHook = Arc<dyn Fn(ConnRef) + Send + Sync>;

/// Hook invoked once when a connection closes.
pub type DisconnectHook = Arc<dyn Fn(&dyn Conn) + Send + Sync>;

/// Lifecycle hooks shared by both server transports.
#[derive(Clone, Default)]
pub struct ServerHooks {
    /// Runs as soon as a connection is accepted, before its receive loop.
    pub on_connect: Option<ConnectHook>,
    /// Installed as the connection's close hook; fires exactly once.
    pub on_disconnect: Option<DisconnectHook>,
}
