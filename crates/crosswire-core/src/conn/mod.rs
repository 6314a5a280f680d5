//! Connection capability shared by every transport.
//!
//! A [`Conn`] reads whole packets, serialises writes, and carries the
//! per-connection runtime state: lifecycle [`ConnState`], a user attribute
//! slot, the auto-crypt policy, a close hook that fires exactly once, and a
//! cancellation token that trips when the connection dies. Two
//! implementations exist: [`StreamConn`] over TCP/TLS byte streams and
//! [`DatagramConn`] for UDP peers.

mod datagram;
mod stream;

use std::{any::Any, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use crosswire_proto::{Packet, Protocol};
use tokio_util::sync::CancellationToken;

pub use datagram::{DatagramConn, INBOUND_CAPACITY, OutboundDatagram};
pub use stream::StreamConn;

use crate::error::NetError;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// No transport attached, or closed.
    Disconnected = 0,
    /// First dial attempt in progress.
    Connecting = 1,
    /// Re-dial in progress after a drop.
    Reconnecting = 2,
    /// Transport attached and healthy.
    Connected = 3,
}

impl ConnState {
    /// Decode a stored state byte; unknown values collapse to
    /// `Disconnected`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Reconnecting,
            3 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Transport a connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain TCP stream.
    Tcp,
    /// TLS over TCP.
    Tls,
    /// UDP datagrams.
    Udp,
}

impl Transport {
    /// Single-letter tag used in log prefixes.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Tcp => "T",
            Self::Tls => "S",
            Self::Udp => "U",
        }
    }

    /// Framing rule packets must use on this transport.
    pub fn wire_protocol(self) -> Protocol {
        match self {
            Self::Tcp | Self::Tls => Protocol::Tcp,
            Self::Udp => Protocol::Udp,
        }
    }
}

/// Opaque per-connection attribute supplied by the application.
pub type UserAttr = Arc<dyn Any + Send + Sync>;

/// Hook invoked exactly once when a connection closes.
pub type CloseHook = Box<dyn FnOnce(&dyn Conn) + Send>;

/// The connection capability.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read the next complete packet, honouring the read deadline and the
    /// cancellation token.
    async fn read_packet(&self) -> Result<Packet, NetError>;

    /// Write raw bytes. Concurrent writers are serialised; the wire sees
    /// whole packets in the order writes return.
    async fn write(&self, bytes: &[u8]) -> Result<usize, NetError>;

    /// Close the connection. Idempotent; the first call transitions the
    /// state, cancels the token and fires the close hook.
    async fn close(&self) -> Result<(), NetError>;

    /// Deadline applied to subsequent reads. Zero disables the deadline.
    fn set_read_timeout(&self, timeout: Duration);

    /// Local socket address.
    fn local_addr(&self) -> SocketAddr;

    /// Remote peer address.
    fn remote_addr(&self) -> SocketAddr;

    /// Current lifecycle state.
    fn state(&self) -> ConnState;

    /// Force the lifecycle state.
    fn set_state(&self, state: ConnState);

    /// True once the connection is disconnected.
    fn is_closed(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    /// Attach an opaque application attribute.
    fn set_attr(&self, attr: UserAttr);

    /// Fetch the application attribute, if set.
    fn attr(&self) -> Option<UserAttr>;

    /// Set whether packet decode applies payload AES automatically.
    fn set_auto_crypt(&self, enabled: bool);

    /// Current auto-crypt policy.
    fn auto_crypt(&self) -> bool;

    /// Install the hook fired on close. Replaces any earlier hook.
    fn set_close_hook(&self, hook: CloseHook);

    /// Token cancelled when the connection closes.
    fn closed_token(&self) -> CancellationToken;

    /// Transport this connection runs over.
    fn transport(&self) -> Transport;

    /// Log prefix in `tag-local-remote` form.
    fn label(&self) -> String {
        format!("{}-{}-{}", self.transport().tag(), self.local_addr(), self.remote_addr())
    }

    /// Short log prefix in `tag-remote` form.
    fn label_short(&self) -> String {
        format!("{}-{}", self.transport().tag(), self.remote_addr())
    }
}

/// Shared reference to a connection.
pub type ConnRef = Arc<dyn Conn>;

/// Frame `packet` for the connection's transport and write it out.
pub async fn send_packet(conn: &dyn Conn, packet: &mut Packet) -> Result<(), NetError> {
    packet.set_protocol(conn.transport().wire_protocol());
    let bytes = packet.pack()?;
    conn.write(&bytes).await?;
    Ok(())
}
