//! UDP client over a single connected socket.
//!
//! No virtual-connection demux and no reconnect loop: the socket is bound
//! and `connect`ed once. The read loop keeps going through decode errors —
//! one mangled datagram is no reason to drop a connectionless peer — and
//! only stops on close or cancellation. Heartbeats default to a much
//! tighter interval than TCP because UDP sessions are evicted by silence.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use crosswire_core::{
    Callbacks, Conn, ConnRef, ConnState, DatagramConn, Dispatcher, Message, NetError,
    PendingCalls, Service, send_packet,
};
use crosswire_proto::{CipherSuite, CmdPacket, HbPacket, MessageType, Packet};
use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::invoke::{InvokeError, InvokeParams, invoke_fire_and_forget, invoke_sync};

/// Default heartbeat interval for UDP peers.
pub const DEFAULT_UDP_HEARTBEAT: Duration = Duration::from_secs(10);

/// Default read timeout for the client socket.
pub const DEFAULT_UDP_READ_TIMEOUT: Duration = Duration::from_secs(45);

/// Callback invoked once the socket is connected.
pub type OnUdpConnected = Arc<dyn Fn(Arc<UdpClient>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Configuration for [`UdpClient::dial`].
#[derive(Clone)]
pub struct UdpClientConfig {
    /// Server address, `host:port`.
    pub addr: String,
    /// Read timeout applied to the socket.
    pub read_timeout: Duration,
    /// Heartbeat interval.
    pub heartbeat: Duration,
    /// Synchronous invoke timeout.
    pub invoke_timeout: Duration,
    /// Payload encoding for invokes.
    pub message_type: MessageType,
    /// Payload cipher for invokes.
    pub suite: CipherSuite,
    /// Send heartbeats automatically.
    pub auto_heartbeat: bool,
}

impl UdpClientConfig {
    /// Defaults for `addr`: 45 s read timeout, 10 s heartbeat, 3000 ms
    /// invoke timeout, binary payloads under AES-256-CFB.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            read_timeout: DEFAULT_UDP_READ_TIMEOUT,
            heartbeat: DEFAULT_UDP_HEARTBEAT,
            invoke_timeout: Duration::from_millis(3000),
            message_type: MessageType::CmdBinary,
            suite: CipherSuite::Aes256Cfb,
            auto_heartbeat: true,
        }
    }
}

/// UDP client bound to one remote peer.
pub struct UdpClient {
    conn: ConnRef,
    hb_secs: AtomicU64,
    invoke_timeout_ms: AtomicU64,
    auto_hb: AtomicBool,
    message_type: AtomicU8,
    suite: AtomicU8,
    service: Arc<Service>,
    pending: Arc<PendingCalls>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl UdpClient {
    /// Bind an ephemeral socket, connect it to `config.addr` and start the
    /// read and heartbeat loops.
    pub async fn dial(
        config: UdpClientConfig,
        service: Arc<Service>,
        callbacks: Callbacks,
        on_connected: Option<OnUdpConnected>,
    ) -> Result<Arc<Self>, NetError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetError::Connect(format!("bind: {e}")))?;
        socket
            .connect(&config.addr)
            .await
            .map_err(|e| NetError::Connect(format!("connect {}: {e}", config.addr)))?;

        let local = socket.local_addr().map_err(|e| NetError::Connect(e.to_string()))?;
        let remote = socket.peer_addr().map_err(|e| NetError::Connect(e.to_string()))?;
        let conn: ConnRef =
            DatagramConn::client(Arc::new(socket), local, remote, config.read_timeout);

        let pending = Arc::new(PendingCalls::new());
        let dispatcher =
            Arc::new(Dispatcher::client(Arc::clone(&service), callbacks, Arc::clone(&pending)));

        let client = Arc::new(Self {
            conn,
            hb_secs: AtomicU64::new(config.heartbeat.as_secs().max(1)),
            invoke_timeout_ms: AtomicU64::new(config.invoke_timeout.as_millis() as u64),
            auto_hb: AtomicBool::new(config.auto_heartbeat),
            message_type: AtomicU8::new(config.message_type.as_u8()),
            suite: AtomicU8::new(config.suite.as_u8()),
            service,
            pending,
            dispatcher,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&client).read_loop());
        tokio::spawn(Arc::clone(&client).heartbeat_loop());

        if let Some(on_connected) = on_connected {
            tokio::spawn(on_connected(Arc::clone(&client)));
        }

        tracing::debug!(conn = %client.conn.label(), "udp client connected");
        Ok(client)
    }

    /// The underlying connection.
    pub fn conn(&self) -> &ConnRef {
        &self.conn
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.conn.state()
    }

    /// Close the socket connection and stop the loops.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.conn.close().await;
    }

    /// Set the heartbeat interval (minimum one second).
    pub fn set_heartbeat_interval(&self, interval: Duration) {
        self.hb_secs.store(interval.as_secs().max(1), Ordering::Relaxed);
    }

    /// Toggle automatic heartbeats.
    pub fn set_auto_heartbeat(&self, enabled: bool) {
        self.auto_hb.store(enabled, Ordering::Relaxed);
    }

    /// Set the synchronous invoke timeout.
    pub fn set_invoke_timeout(&self, timeout: Duration) {
        self.invoke_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn invoke_params(&self) -> InvokeParams {
        let message_type = MessageType::from_u8(self.message_type.load(Ordering::Relaxed))
            .unwrap_or(MessageType::CmdBinary);
        let suite = CipherSuite::from_u8(self.suite.load(Ordering::Relaxed))
            .unwrap_or(CipherSuite::Aes256Cfb);
        InvokeParams {
            message_type,
            suite,
            timeout: Duration::from_millis(self.invoke_timeout_ms.load(Ordering::Relaxed)),
            // a timed-out datagram exchange does not invalidate the socket
            close_on_timeout: false,
        }
    }

    /// Synchronous call over UDP. A timeout leaves the connection open.
    pub async fn invoke(
        &self,
        cancel: &CancellationToken,
        cmd_id: u64,
        req: &dyn Message,
    ) -> Result<(CmdPacket, Option<Box<dyn Message>>), InvokeError> {
        let state = self.state();
        if state != ConnState::Connected {
            return Err(InvokeError::NotConnected(state));
        }
        invoke_sync(
            &self.conn,
            &self.pending,
            &self.service,
            cancel,
            cmd_id,
            req,
            self.invoke_params(),
        )
        .await
    }

    /// Fire-and-forget call; any response takes the callback path.
    pub async fn invoke_async(&self, cmd_id: u64, req: &dyn Message) -> Result<u64, InvokeError> {
        let state = self.state();
        if state != ConnState::Connected {
            return Err(InvokeError::NotConnected(state));
        }
        invoke_fire_and_forget(&self.conn, cmd_id, req, self.invoke_params()).await
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let packet = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.conn.read_packet() => match result {
                    Ok(packet) => packet,
                    Err(NetError::Closed | NetError::Cancelled) => {
                        tracing::debug!(conn = %self.conn.label_short(), "udp read loop ended");
                        return;
                    }
                    Err(err) => {
                        // datagram transports shrug off mangled or late input
                        tracing::warn!(conn = %self.conn.label_short(), "udp read error: {err}");
                        continue;
                    }
                },
            };

            let dispatcher = Arc::clone(&self.dispatcher);
            let conn = Arc::clone(&self.conn);
            tokio::spawn(async move {
                dispatcher.dispatch(packet, &conn).await;
            });
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            let interval = Duration::from_secs(self.hb_secs.load(Ordering::Relaxed));
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            if self.conn.is_closed() {
                return;
            }
            if !self.auto_hb.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(err) =
                send_packet(self.conn.as_ref(), &mut Packet::Heartbeat(HbPacket::new())).await
            {
                tracing::warn!(conn = %self.conn.label_short(), "heartbeat write failed: {err}");
                return;
            }
        }
    }
}
