//! Stream connection over TCP or TLS.
//!
//! Generic over the byte stream so the same connection type wraps plain TCP
//! sockets and TLS sessions; callers hold it as a [`crate::conn::ConnRef`].
//! The stream is split once at construction: the read half feeds the packet
//! reader behind an async mutex (single reader by convention), the write
//! half serialises concurrent writers behind its own lock. Closing is
//! race-free: whichever caller flips the state first runs the close hook and
//! shuts the transport down; everyone else sees an already-closed
//! connection.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use crosswire_proto::{Packet, read_stream_packet};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::{
    conn::{CloseHook, Conn, ConnState, Transport, UserAttr},
    error::NetError,
};

/// A TCP or TLS connection.
pub struct StreamConn<S> {
    reader: AsyncMutex<ReadHalf<S>>,
    writer: AsyncMutex<WriteHalf<S>>,
    transport: Transport,
    local: SocketAddr,
    peer: SocketAddr,
    state: AtomicU8,
    auto_crypt: AtomicBool,
    read_timeout_ms: AtomicU64,
    attr: parking_lot::Mutex<Option<UserAttr>>,
    close_hook: parking_lot::Mutex<Option<CloseHook>>,
    cancel: CancellationToken,
}

impl<S> StreamConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an established stream. The connection starts in
    /// [`ConnState::Connected`] with auto-crypt on.
    pub fn new(
        stream: S,
        local: SocketAddr,
        peer: SocketAddr,
        transport: Transport,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        Arc::new(Self {
            reader: AsyncMutex::new(read_half),
            writer: AsyncMutex::new(write_half),
            transport,
            local,
            peer,
            state: AtomicU8::new(ConnState::Connected as u8),
            auto_crypt: AtomicBool::new(true),
            read_timeout_ms: AtomicU64::new(0),
            attr: parking_lot::Mutex::new(None),
            close_hook: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl<S> Conn for StreamConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_packet(&self) -> Result<Packet, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }

        let timeout_ms = self.read_timeout_ms.load(Ordering::Relaxed);
        let mut reader = self.reader.lock().await;
        let read = read_stream_packet(&mut *reader, self.auto_crypt());

        tokio::select! {
            () = self.cancel.cancelled() => Err(NetError::Cancelled),
            result = async {
                if timeout_ms == 0 {
                    read.await.map_err(NetError::from)
                } else {
                    let deadline = Duration::from_millis(timeout_ms);
                    match tokio::time::timeout(deadline, read).await {
                        Ok(result) => result.map_err(NetError::from),
                        Err(_) => Err(NetError::Timeout(deadline)),
                    }
                }
            } => result,
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<usize, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.map_err(|e| NetError::Write(e.to_string()))?;
        writer.flush().await.map_err(|e| NetError::Write(e.to_string()))?;
        Ok(bytes.len())
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

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Duration) {
        self.read_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
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
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use crosswire_proto::HbPacket;

    use super::*;
    use crate::conn::send_packet;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn reads_packets_from_the_stream() {
        let (client, server) = tokio::io::duplex(256);
        let conn = StreamConn::new(server, addr(1), addr(2), Transport::Tcp);

        let (_rx, mut tx) = tokio::io::split(client);
        tx.write_all(&[0x38, 0x00]).await.unwrap();

        let packet = conn.read_packet().await.unwrap();
        assert!(matches!(packet, Packet::Heartbeat(_)));
    }

    #[tokio::test]
    async fn writes_are_visible_to_the_peer() {
        let (client, server) = tokio::io::duplex(256);
        let conn = StreamConn::new(server, addr(1), addr(2), Transport::Tcp);

        send_packet(conn.as_ref(), &mut Packet::Heartbeat(HbPacket::new())).await.unwrap();

        let (mut rx, _tx) = tokio::io::split(client);
        let mut buf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut rx, &mut buf).await.unwrap();
        assert_eq!(buf, [0x38, 0x00]);
    }

    #[tokio::test]
    async fn read_deadline_times_out() {
        let (_client, server) = tokio::io::duplex(256);
        let conn = StreamConn::new(server, addr(1), addr(2), Transport::Tcp);
        conn.set_read_timeout(Duration::from_millis(20));

        let err = conn.read_packet().await.unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));
    }

    #[tokio::test]
    async fn close_fires_hook_exactly_once() {
        let (_client, server) = tokio::io::duplex(256);
        let conn = StreamConn::new(server, addr(1), addr(2), Transport::Tcp);

        static FIRED: AtomicUsize = AtomicUsize::new(0);
        conn.set_close_hook(Box::new(|_: &dyn Conn| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnState::Disconnected);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn close_cancels_a_blocked_reader() {
        let (_client, server) = tokio::io::duplex(256);
        let conn = StreamConn::new(server, addr(1), addr(2), Transport::Tcp);

        let reader = Arc::clone(&conn);
        let handle = tokio::spawn(async move { reader.read_packet().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.close().await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NetError::Cancelled)));
    }

    #[tokio::test]
    async fn writes_after_close_are_rejected() {
        let (_client, server) = tokio::io::duplex(256);
        let conn = StreamConn::new(server, addr(1), addr(2), Transport::Tcp);
        conn.close().await.unwrap();

        let err = conn.write(&[0x38, 0x00]).await.unwrap_err();
        assert!(matches!(err, NetError::Closed));
    }

    #[tokio::test]
    async fn attr_round_trip() {
        let (_client, server) = tokio::io::duplex(256);
        let conn = StreamConn::new(server, addr(1), addr(2), Transport::Tls);
        assert!(conn.attr().is_none());

        conn.set_attr(Arc::new("device-7".to_string()));
        let attr = conn.attr().unwrap();
        assert_eq!(attr.downcast_ref::<String>().unwrap(), "device-7");
        assert_eq!(conn.label(), "S-127.0.0.1:1-127.0.0.1:2");
    }
}
