//! Reconnecting TCP/TLS client.
//!
//! One background task owns the dial loop. Per established connection it
//! runs a read loop (deadline = heartbeat interval + 10 s) and a heartbeat
//! loop concurrently; when either ends the connection is closed, the loop
//! sleeps the retry interval and dials again — until [`TcpClient::close`]
//! is called. Synchronous invokes rendezvous with the read loop through the
//! pending-call table.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use crosswire_core::{
    Callbacks, Conn, ConnRef, ConnState, Dispatcher, Message, NetError, PendingCalls, Service,
    StreamConn, Transport, send_packet,
};
use crosswire_proto::{CipherSuite, CmdPacket, HbPacket, MessageType, Packet};
use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use tokio::{net::TcpStream, sync::oneshot};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::invoke::{InvokeError, InvokeParams, invoke_fire_and_forget, invoke_sync};

/// Smallest accepted heartbeat interval.
pub const MIN_HEARTBEAT: Duration = Duration::from_secs(10);

/// Smallest accepted reconnect back-off.
pub const MIN_RETRY: Duration = Duration::from_secs(1);

/// Slack added to the heartbeat interval to form the read deadline.
const READ_DEADLINE_SLACK: Duration = Duration::from_secs(10);

/// Callback invoked on every successful (re)connect.
pub type OnConnected = Arc<dyn Fn(Arc<TcpClient>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Configuration for [`TcpClient::dial`].
#[derive(Clone)]
pub struct TcpClientConfig {
    /// Endpoint URL, scheme `tcp` or `tls` (e.g. `tcp://198.51.100.7:9000`).
    pub url: String,
    /// TLS context; required for the `tls` scheme.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Per-attempt dial timeout.
    pub dial_timeout: Duration,
    /// Heartbeat interval; clamped to [`MIN_HEARTBEAT`].
    pub heartbeat: Duration,
    /// Reconnect back-off; clamped to [`MIN_RETRY`].
    pub retry_interval: Duration,
    /// Synchronous invoke timeout.
    pub invoke_timeout: Duration,
    /// Payload encoding for invokes.
    pub message_type: MessageType,
    /// Payload cipher for invokes.
    pub suite: CipherSuite,
    /// Send heartbeats automatically.
    pub auto_heartbeat: bool,
}

impl TcpClientConfig {
    /// Defaults for `url`: 5 s dial timeout, 180 s heartbeat, 3 s retry,
    /// 3000 ms invoke timeout, binary payloads under AES-256-CFB.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tls: None,
            dial_timeout: Duration::from_secs(5),
            heartbeat: Duration::from_secs(180),
            retry_interval: Duration::from_secs(3),
            invoke_timeout: Duration::from_millis(3000),
            message_type: MessageType::CmdBinary,
            suite: CipherSuite::Aes256Cfb,
            auto_heartbeat: true,
        }
    }
}

struct Endpoint {
    host: String,
    port: u16,
    transport: Transport,
}

fn parse_endpoint(raw: &str) -> Result<Endpoint, NetError> {
    let url = Url::parse(raw).map_err(|e| NetError::Connect(format!("invalid url {raw}: {e}")))?;
    let transport = match url.scheme() {
        "tcp" => Transport::Tcp,
        "tls" => Transport::Tls,
        other => return Err(NetError::Connect(format!("unsupported scheme: {other}"))),
    };
    let host = url
        .host_str()
        .ok_or_else(|| NetError::Connect(format!("missing host in {raw}")))?
        .to_string();
    let port = url.port().ok_or_else(|| NetError::Connect(format!("missing port in {raw}")))?;
    Ok(Endpoint { host, port, transport })
}

/// Reconnecting TCP/TLS client.
pub struct TcpClient {
    endpoint: Endpoint,
    tls: Option<TlsConnector>,
    dial_timeout: Duration,
    hb_secs: AtomicU64,
    retry_secs: AtomicU64,
    invoke_timeout_ms: AtomicU64,
    auto_hb: AtomicBool,
    message_type: AtomicU8,
    suite: AtomicU8,
    service: Arc<Service>,
    pending: Arc<PendingCalls>,
    dispatcher: Arc<Dispatcher>,
    conn: tokio::sync::RwLock<Option<ConnRef>>,
    state: AtomicU8,
    stop: AtomicBool,
    cancel: CancellationToken,
    on_connected: Option<OnConnected>,
}

impl TcpClient {
    /// Dial `config.url` and start the reconnect loop.
    ///
    /// Blocks until the first attempt resolves, then returns the client.
    /// A failed first attempt is reported once and the dial loop keeps
    /// retrying in the background — watch [`TcpClient::state`] for the
    /// transition to `Connected`. The loop runs until
    /// [`TcpClient::close`]. `Err` is reserved for configuration problems
    /// (bad URL, missing TLS context).
    pub async fn dial(
        config: TcpClientConfig,
        service: Arc<Service>,
        callbacks: Callbacks,
        on_connected: Option<OnConnected>,
    ) -> Result<Arc<Self>, NetError> {
        let endpoint = parse_endpoint(&config.url)?;
        if endpoint.transport == Transport::Tls && config.tls.is_none() {
            return Err(NetError::Connect("tls scheme requires a TLS config".into()));
        }

        let pending = Arc::new(PendingCalls::new());
        let dispatcher =
            Arc::new(Dispatcher::client(Arc::clone(&service), callbacks, Arc::clone(&pending)));

        let client = Arc::new(Self {
            endpoint,
            tls: config.tls.map(TlsConnector::from),
            dial_timeout: config.dial_timeout,
            hb_secs: AtomicU64::new(config.heartbeat.max(MIN_HEARTBEAT).as_secs()),
            retry_secs: AtomicU64::new(config.retry_interval.max(MIN_RETRY).as_secs()),
            invoke_timeout_ms: AtomicU64::new(config.invoke_timeout.as_millis() as u64),
            auto_hb: AtomicBool::new(config.auto_heartbeat),
            message_type: AtomicU8::new(config.message_type.as_u8()),
            suite: AtomicU8::new(config.suite.as_u8()),
            service,
            pending,
            dispatcher,
            conn: tokio::sync::RwLock::new(None),
            state: AtomicU8::new(ConnState::Disconnected as u8),
            stop: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            on_connected,
        });

        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(Arc::clone(&client).run(first_tx));

        // One signal per dial, success or failure; the loop retries either
        // way.
        match first_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!("first connect attempt failed: {err}, dial loop retrying");
            }
            Err(_) => return Err(NetError::Closed),
        }
        Ok(client)
    }

    /// Current client state.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// The live connection, if any. Useful for pushing media or customer
    /// packets outside the invoke path.
    pub async fn current_conn(&self) -> Option<ConnRef> {
        self.conn.read().await.clone()
    }

    /// The registry this client decodes responses against.
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Stop the dial loop and close the connection.
    pub async fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(conn) = self.current_conn().await {
            let _ = conn.close().await;
        }
        self.set_state(ConnState::Disconnected);
    }

    /// Set the heartbeat interval; values below [`MIN_HEARTBEAT`] are
    /// ignored.
    pub fn set_heartbeat_interval(&self, interval: Duration) {
        if interval >= MIN_HEARTBEAT {
            self.hb_secs.store(interval.as_secs(), Ordering::Relaxed);
        }
    }

    /// Current heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.hb_secs.load(Ordering::Relaxed))
    }

    /// Set the reconnect back-off; values below [`MIN_RETRY`] are ignored.
    pub fn set_retry_interval(&self, interval: Duration) {
        if interval >= MIN_RETRY {
            self.retry_secs.store(interval.as_secs(), Ordering::Relaxed);
        }
    }

    /// Current reconnect back-off.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_secs.load(Ordering::Relaxed))
    }

    /// Set the synchronous invoke timeout.
    pub fn set_invoke_timeout(&self, timeout: Duration) {
        self.invoke_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Toggle automatic heartbeats.
    pub fn set_auto_heartbeat(&self, enabled: bool) {
        self.auto_hb.store(enabled, Ordering::Relaxed);
    }

    /// Set the payload cipher used for invokes.
    pub fn set_cipher(&self, suite: CipherSuite) {
        self.suite.store(suite.as_u8(), Ordering::Relaxed);
    }

    fn invoke_params(&self) -> InvokeParams {
        // stored values originate from the enums, so the round-trip holds
        let message_type = MessageType::from_u8(self.message_type.load(Ordering::Relaxed))
            .unwrap_or(MessageType::CmdBinary);
        let suite = CipherSuite::from_u8(self.suite.load(Ordering::Relaxed))
            .unwrap_or(CipherSuite::Aes256Cfb);
        InvokeParams {
            message_type,
            suite,
            timeout: Duration::from_millis(self.invoke_timeout_ms.load(Ordering::Relaxed)),
            close_on_timeout: true,
        }
    }

    /// Synchronous call: send `req` for `cmd_id` and wait for the matching
    /// response.
    ///
    /// `cancel` aborts the wait without touching the connection; a timeout
    /// closes the connection (the dial loop reconnects). Returns the
    /// response packet and the response handler's decoded message.
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
        let conn =
            self.current_conn().await.ok_or(InvokeError::NotConnected(ConnState::Disconnected))?;

        invoke_sync(
            &conn,
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
        let conn =
            self.current_conn().await.ok_or(InvokeError::NotConnected(ConnState::Disconnected))?;

        invoke_fire_and_forget(&conn, cmd_id, req, self.invoke_params()).await
    }

    async fn connect_once(&self) -> Result<ConnRef, NetError> {
        let address = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| NetError::Connect(format!("dial {address} timed out")))?
            .map_err(|e| NetError::Connect(format!("dial {address}: {e}")))?;

        let local = stream.local_addr().map_err(|e| NetError::Connect(e.to_string()))?;
        let peer = stream.peer_addr().map_err(|e| NetError::Connect(e.to_string()))?;

        match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(self.endpoint.host.clone())
                    .map_err(|e| NetError::Connect(format!("bad server name: {e}")))?;
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| NetError::Connect(format!("tls handshake: {e}")))?;
                Ok(self.wrap(tls_stream, local, peer, Transport::Tls))
            }
            None => Ok(self.wrap(stream, local, peer, Transport::Tcp)),
        }
    }

    fn wrap<S>(
        &self,
        stream: S,
        local: SocketAddr,
        peer: SocketAddr,
        transport: Transport,
    ) -> ConnRef
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        StreamConn::new(stream, local, peer, transport)
    }

    async fn sleep_retry(&self) -> bool {
        let backoff = self.retry_interval();
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(backoff) => !self.stop.load(Ordering::SeqCst),
        }
    }

    async fn run(self: Arc<Self>, first: oneshot::Sender<Result<(), NetError>>) {
        let mut first = Some(first);
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.set_state(if first.is_some() {
                ConnState::Connecting
            } else {
                ConnState::Reconnecting
            });

            let conn = match self.connect_once().await {
                Err(err) => {
                    tracing::warn!(
                        endpoint = %format!("{}:{}", self.endpoint.host, self.endpoint.port),
                        "connect failed: {err}, retrying in {:?}",
                        self.retry_interval()
                    );
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(err));
                    }
                    if self.sleep_retry().await {
                        continue;
                    }
                    break;
                }
                Ok(conn) => conn,
            };

            tracing::debug!(conn = %conn.label(), "connected");
            *self.conn.write().await = Some(Arc::clone(&conn));
            self.set_state(ConnState::Connected);
            if let Some(tx) = first.take() {
                let _ = tx.send(Ok(()));
            }

            if let Some(on_connected) = &self.on_connected {
                tokio::spawn(on_connected(Arc::clone(&self)));
            }

            tokio::select! {
                () = self.cancel.cancelled() => {}
                () = self.read_loop(Arc::clone(&conn)) => {}
                () = self.heartbeat_loop(Arc::clone(&conn)) => {}
            }

            self.set_state(ConnState::Disconnected);
            let _ = conn.close().await;
            *self.conn.write().await = None;
            tracing::debug!(conn = %conn.label(), "disconnected");

            if self.stop.load(Ordering::SeqCst) || !self.sleep_retry().await {
                break;
            }
        }
        self.set_state(ConnState::Disconnected);
        tracing::debug!("dial loop stopped");
    }

    async fn read_loop(&self, conn: ConnRef) {
        loop {
            let deadline = self.heartbeat_interval() + READ_DEADLINE_SLACK;
            conn.set_read_timeout(deadline);
            match conn.read_packet().await {
                Ok(packet) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let conn = Arc::clone(&conn);
                    tokio::spawn(async move {
                        dispatcher.dispatch(packet, &conn).await;
                    });
                }
                Err(err) => {
                    tracing::debug!(conn = %conn.label_short(), "read loop ended: {err}");
                    return;
                }
            }
        }
    }

    async fn heartbeat_loop(&self, conn: ConnRef) {
        loop {
            tokio::time::sleep(self.heartbeat_interval()).await;
            if conn.is_closed() {
                return;
            }
            if !self.auto_hb.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(err) =
                send_packet(conn.as_ref(), &mut Packet::Heartbeat(HbPacket::new())).await
            {
                tracing::warn!(conn = %conn.label_short(), "heartbeat write failed: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_tls_endpoints() {
        let endpoint = parse_endpoint("tcp://203.0.113.4:9000").unwrap();
        assert_eq!(endpoint.host, "203.0.113.4");
        assert_eq!(endpoint.port, 9000);
        assert_eq!(endpoint.transport, Transport::Tcp);

        let endpoint = parse_endpoint("tls://gateway.example.com:8443").unwrap();
        assert_eq!(endpoint.host, "gateway.example.com");
        assert_eq!(endpoint.transport, Transport::Tls);
    }

    #[test]
    fn rejects_unknown_schemes_and_missing_parts() {
        assert!(parse_endpoint("quic://127.0.0.1:9000").is_err());
        assert!(parse_endpoint("tcp://127.0.0.1").is_err());
        assert!(parse_endpoint("not a url").is_err());
    }

    #[test]
    fn config_clamps_intervals() {
        let mut config = TcpClientConfig::new("tcp://127.0.0.1:1");
        config.heartbeat = Duration::from_secs(1);
        config.retry_interval = Duration::from_millis(1);
        assert_eq!(config.heartbeat.max(MIN_HEARTBEAT), MIN_HEARTBEAT);
        assert_eq!(config.retry_interval.max(MIN_RETRY), MIN_RETRY);
    }
}
