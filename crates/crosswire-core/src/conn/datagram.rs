//! Datagram connections over a shared UDP socket.
//!
//! Two modes share one type, mirroring the two ends of the UDP transport:
//!
//! - **Virtual connection** (server side): carved out of the listener's
//!   single socket by remote address. Reads come from a bounded inbound
//!   channel the server's read loop fills; writes go onto the server's
//!   shared outbound channel; closing enqueues an eviction request instead
//!   of touching the session table or the socket.
//! - **Connected client socket**: reads and writes go straight to the
//!   socket, which this connection owns.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use crosswire_proto::{MAX_DATAGRAM, Packet, read_datagram_packet};
use tokio::{net::UdpSocket, sync::Mutex as AsyncMutex, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    conn::{CloseHook, Conn, ConnState, Transport, UserAttr},
    error::NetError,
};

/// Capacity of a virtual connection's inbound datagram channel.
pub const INBOUND_CAPACITY: usize = 1024;

/// Outbound unit on the server's shared write channel: payload plus
/// destination.
pub type OutboundDatagram = (Vec<u8>, SocketAddr);

/// A UDP connection, either a server-side virtual connection or a connected
/// client socket.
pub struct DatagramConn {
    socket: Arc<UdpSocket>,
    /// `Some` marks a virtual connection bound to that remote.
    peer: Option<SocketAddr>,
    remote: SocketAddr,
    local: SocketAddr,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    outbound: Option<mpsc::Sender<OutboundDatagram>>,
    evictions: Option<mpsc::Sender<String>>,
    read_timeout_ms: AtomicU64,
    state: AtomicU8,
    auto_crypt: AtomicBool,
    attr: parking_lot::Mutex<Option<UserAttr>>,
    close_hook: parking_lot::Mutex<Option<CloseHook>>,
    cancel: CancellationToken,
}

impl DatagramConn {
    /// Virtual connection for `peer`, demultiplexed from the server socket.
    ///
    /// `outbound` is the server's shared write channel, `evictions` its
    /// session-eviction channel; the cancellation token is a child of the
    /// server's token so server shutdown tears every session down.
    pub fn virtual_conn(
        socket: Arc<UdpSocket>,
        local: SocketAddr,
        peer: SocketAddr,
        read_timeout: Duration,
        outbound: mpsc::Sender<OutboundDatagram>,
        evictions: mpsc::Sender<String>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Arc::new(Self {
            socket,
            peer: Some(peer),
            remote: peer,
            local,
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            outbound: Some(outbound),
            evictions: Some(evictions),
            read_timeout_ms: AtomicU64::new(read_timeout.as_millis() as u64),
            state: AtomicU8::new(ConnState::Connected as u8),
            auto_crypt: AtomicBool::new(true),
            attr: parking_lot::Mutex::new(None),
            close_hook: parking_lot::Mutex::new(None),
            cancel: parent.child_token(),
        })
    }

    /// Connection over a socket already `connect`ed to `remote`.
    pub fn client(
        socket: Arc<UdpSocket>,
        local: SocketAddr,
        remote: SocketAddr,
        read_timeout: Duration,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        Arc::new(Self {
            socket,
            peer: None,
            remote,
            local,
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            outbound: None,
            evictions: None,
            read_timeout_ms: AtomicU64::new(read_timeout.as_millis() as u64),
            state: AtomicU8::new(ConnState::Connected as u8),
            auto_crypt: AtomicBool::new(true),
            attr: parking_lot::Mutex::new(None),
            close_hook: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// True for server-side virtual connections.
    pub fn is_virtual(&self) -> bool {
        self.peer.is_some()
    }

    /// Hand a received datagram to this virtual connection.
    ///
    /// Applies backpressure on the bounded inbound channel; returns `false`
    /// once the connection is closed.
    pub async fn push_datagram(&self, datagram: Vec<u8>) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.inbound_tx.send(datagram) => sent.is_ok(),
        }
    }

    fn read_deadline(&self) -> Option<Duration> {
        let ms = self.read_timeout_ms.load(Ordering::Relaxed);
        (ms != 0).then_some(Duration::from_millis(ms))
    }
}

#[async_trait]
impl Conn for DatagramConn {
    async fn read_packet(&self) -> Result<Packet, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }

        let deadline = self.read_deadline();
        if self.is_virtual() {
            let mut inbound = self.inbound_rx.lock().await;
            let receive = async {
                match inbound.recv().await {
                    Some(datagram) => {
                        read_datagram_packet(&datagram, self.auto_crypt()).map_err(NetError::from)
                    }
                    None => Err(NetError::Closed),
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => Err(NetError::Cancelled),
                result = async {
                    match deadline {
                        Some(deadline) => tokio::time::timeout(deadline, receive)
                            .await
                            .unwrap_or(Err(NetError::Timeout(deadline))),
                        None => receive.await,
                    }
                } => result,
            }
        } else {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let receive = async {
                let n = self.socket.recv(&mut buf).await.map_err(|e| NetError::Read(e.to_string()))?;
                read_datagram_packet(&buf[..n], self.auto_crypt()).map_err(NetError::from)
            };

            tokio::select! {
                () = self.cancel.cancelled() => Err(NetError::Cancelled),
                result = async {
                    match deadline {
                        Some(deadline) => tokio::time::timeout(deadline, receive)
                            .await
                            .unwrap_or(Err(NetError::Timeout(deadline))),
                        None => receive.await,
                    }
                } => result,
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<usize, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }

        match (self.peer, &self.outbound) {
            (Some(peer), Some(outbound)) => {
                outbound
                    .send((bytes.to_vec(), peer))
                    .await
                    .map_err(|_| NetError::Closed)?;
                Ok(bytes.len())
            }
            _ => self.socket.send(bytes).await.map_err(|e| NetError::Write(e.to_string())),
        }
    }

    async fn close(&self) -> Result<(), NetError> {
        let previous = self.state.swap(ConnState::Disconnected as u8, Ordering::SeqCst);
        if previous == ConnState::Disconnected as u8 {
            return Ok(());
        }

        self.cancel.cancel();

        let hook = self.close_hook.lock().take();
        if let Some(hook) = hook {
            hook(self);
        }

        // The socket is shared with the listener; only ask the session table
        // to forget this peer. The client-mode socket is released on drop.
        if let (Some(peer), Some(evictions)) = (self.peer, &self.evictions) {
            let _ = evictions.send(peer.to_string()).await;
        }
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Duration) {
        self.read_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn set_attr(&self, attr: UserAttr) {
        *self.attr.lock() = Some(attr);
    }

    fn attr(&self) -> Option<UserAttr> {
        self.attr.lock().clone()
    }

    fn set_auto_crypt(&self, enabled: bool) {
        self.auto_crypt.store(enabled, Ordering::Relaxed);
    }

    fn auto_crypt(&self) -> bool {
        self.auto_crypt.load(Ordering::Relaxed)
    }

    fn set_close_hook(&self, hook: CloseHook) {
        *self.close_hook.lock() = Some(hook);
    }

    fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn transport(&self) -> Transport {
        Transport::Udp
    }
}

#[cfg(test)]
mod tests {
    use crosswire_proto::{HbPacket, Protocol};

    use super::*;

    async fn shared_socket() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        (Arc::new(socket), local)
    }

    fn udp_heartbeat() -> Vec<u8> {
        let mut hb = HbPacket::new();
        hb.header.protocol = Protocol::Udp;
        hb.pack().unwrap()
    }

    #[tokio::test]
    async fn virtual_conn_reads_pushed_datagrams() {
        let (socket, local) = shared_socket().await;
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (evict_tx, _evict_rx) = mpsc::channel(8);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let cancel = CancellationToken::new();

        let conn = DatagramConn::virtual_conn(
            socket,
            local,
            peer,
            Duration::from_secs(5),
            out_tx,
            evict_tx,
            &cancel,
        );

        assert!(conn.push_datagram(udp_heartbeat()).await);
        let packet = conn.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::Heartbeat(_)));
        assert_eq!(packet.header().protocol, Protocol::Udp);
    }

    #[tokio::test]
    async fn virtual_conn_write_goes_to_outbound_channel() {
        let (socket, local) = shared_socket().await;
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (evict_tx, _evict_rx) = mpsc::channel(8);
        let peer: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let cancel = CancellationToken::new();

        let conn = DatagramConn::virtual_conn(
            socket,
            local,
            peer,
            Duration::from_secs(5),
            out_tx,
            evict_tx,
            &cancel,
        );

        conn.write(&[0x51, 0x70, 0x38, 0x00]).await.unwrap();
        let (bytes, target) = out_rx.recv().await.unwrap();
        assert_eq!(bytes, [0x51, 0x70, 0x38, 0x00]);
        assert_eq!(target, peer);
    }

    #[tokio::test]
    async fn virtual_conn_close_requests_eviction() {
        let (socket, local) = shared_socket().await;
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (evict_tx, mut evict_rx) = mpsc::channel(8);
        let peer: SocketAddr = "127.0.0.1:4002".parse().unwrap();
        let cancel = CancellationToken::new();

        let conn = DatagramConn::virtual_conn(
            socket,
            local,
            peer,
            Duration::from_secs(5),
            out_tx,
            evict_tx,
            &cancel,
        );

        conn.close().await.unwrap();
        assert_eq!(evict_rx.recv().await.unwrap(), peer.to_string());
        assert!(conn.is_closed());
        assert!(!conn.push_datagram(udp_heartbeat()).await);
    }

    #[tokio::test]
    async fn virtual_conn_read_times_out() {
        let (socket, local) = shared_socket().await;
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (evict_tx, _evict_rx) = mpsc::channel(8);
        let peer: SocketAddr = "127.0.0.1:4003".parse().unwrap();
        let cancel = CancellationToken::new();

        let conn = DatagramConn::virtual_conn(
            socket,
            local,
            peer,
            Duration::from_millis(30),
            out_tx,
            evict_tx,
            &cancel,
        );

        let err = conn.read_packet().await.unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));
    }

    #[tokio::test]
    async fn server_cancellation_reaches_virtual_conns() {
        let (socket, local) = shared_socket().await;
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (evict_tx, _evict_rx) = mpsc::channel(8);
        let peer: SocketAddr = "127.0.0.1:4004".parse().unwrap();
        let cancel = CancellationToken::new();

        let conn = DatagramConn::virtual_conn(
            socket,
            local,
            peer,
            Duration::from_secs(60),
            out_tx,
            evict_tx,
            &cancel,
        );

        let reader = Arc::clone(&conn);
        let handle = tokio::spawn(async move { reader.read_packet().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NetError::Cancelled)));
    }

    #[tokio::test]
    async fn client_socket_round_trip() {
        let (peer_socket, peer_addr) = shared_socket().await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(peer_addr).await.unwrap();
        let local = socket.local_addr().unwrap();
        let conn = DatagramConn::client(
            Arc::new(socket),
            local,
            peer_addr,
            Duration::from_secs(5),
        );
        assert!(!conn.is_virtual());

        conn.write(&udp_heartbeat()).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = peer_socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], udp_heartbeat().as_slice());
        assert_eq!(from, local);

        peer_socket.send_to(&udp_heartbeat(), local).await.unwrap();
        let packet = conn.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::Heartbeat(_)));
    }
}
