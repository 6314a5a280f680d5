//! UDP server: one socket, many virtual connections.
//!
//! Three long-lived tasks share the socket. The read loop demultiplexes
//! datagrams by source address through the session table, creating a
//! virtual connection (and emitting it on the accept channel) for each new
//! remote; the write loop drains the shared outbound channel; the close
//! loop drains eviction requests enqueued by closing connections. A
//! session-table overflow drops the datagram — the peer simply never
//! existed as far as the server is concerned.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use crosswire_core::{
    Callbacks, Conn, ConnRef, DatagramConn, Dispatcher, NetError, OutboundDatagram, Service,
    SessionError, SessionTable,
};
use crosswire_proto::MAX_DATAGRAM;
use tokio::{
    net::UdpSocket,
    sync::{Mutex as AsyncMutex, mpsc},
};
use tokio_util::sync::CancellationToken;

use crate::{ServerError, ServerHooks};

/// Capacity of the shared outbound datagram channel.
pub const OUTBOUND_CAPACITY: usize = 2048;

/// Capacity of the accept channel for newly-seen remotes.
pub const ACCEPT_CAPACITY: usize = 1024;

/// Capacity of the session-eviction channel.
pub const EVICT_CAPACITY: usize = 2048;

/// Session bound substituted for a configured `max_sessions` of zero.
pub const DEFAULT_MAX_SESSIONS: i64 = 10_000_000;

/// Configuration for [`UdpServer::bind`].
#[derive(Clone)]
pub struct UdpServerConfig {
    /// Local address to bind, e.g. `0.0.0.0`.
    pub ip: String,
    /// Local port.
    pub port: u16,
    /// Session bound; `0` selects [`DEFAULT_MAX_SESSIONS`], negative values
    /// clamp to 100.
    pub max_sessions: i64,
    /// Read timeout for virtual connections.
    pub read_timeout: Duration,
    /// Dispatch each packet on a fresh task instead of inline.
    pub spawn_dispatch: bool,
}

impl UdpServerConfig {
    /// Defaults for `ip:port`: the standard session bound, 45 s read
    /// timeout, spawned dispatch.
    pub fn new(ip: impl Into<String>, port: u16, max_sessions: i64) -> Self {
        Self {
            ip: ip.into(),
            port,
            max_sessions,
            read_timeout: Duration::from_secs(45),
            spawn_dispatch: true,
        }
    }
}

/// Datagram server multiplexing virtual connections over one socket.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    sessions: Arc<SessionTable<Arc<DatagramConn>>>,
    accept_rx: AsyncMutex<mpsc::Receiver<Arc<DatagramConn>>>,
    outbound_tx: mpsc::Sender<OutboundDatagram>,
    evict_tx: mpsc::Sender<String>,
    read_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
    hooks: ServerHooks,
    spawn_dispatch: bool,
    conn_count: AtomicI64,
    cancel: CancellationToken,
}

impl UdpServer {
    /// Bind the socket and launch the read/write/close loops.
    pub async fn bind(
        config: UdpServerConfig,
        service: Arc<Service>,
        callbacks: Callbacks,
        hooks: ServerHooks,
    ) -> Result<Arc<Self>, ServerError> {
        let max_sessions = match config.max_sessions {
            n if n < 0 => 100,
            0 => DEFAULT_MAX_SESSIONS,
            n => n,
        };

        let socket = UdpSocket::bind((config.ip.as_str(), config.port))
            .await
            .map_err(|e| ServerError::Transport(format!("bind {}:{}: {e}", config.ip, config.port)))?;
        let local = socket.local_addr().map_err(|e| ServerError::Transport(e.to_string()))?;

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (evict_tx, evict_rx) = mpsc::channel(EVICT_CAPACITY);

        let server = Arc::new(Self {
            socket: Arc::new(socket),
            local,
            sessions: Arc::new(SessionTable::new(max_sessions)),
            accept_rx: AsyncMutex::new(accept_rx),
            outbound_tx,
            evict_tx,
            read_timeout: config.read_timeout,
            dispatcher: Arc::new(Dispatcher::server(service, callbacks)),
            hooks,
            spawn_dispatch: config.spawn_dispatch,
            conn_count: AtomicI64::new(0),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&server).read_loop(accept_tx));
        tokio::spawn(Arc::clone(&server).write_loop(outbound_rx));
        tokio::spawn(Arc::clone(&server).close_loop(evict_rx));

        tracing::info!(addr = %local, max_sessions, "udp server bound");
        Ok(server)
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Sessions currently in the table.
    pub fn session_count(&self) -> i64 {
        self.sessions.len()
    }

    /// Connections currently being served by [`UdpServer::serve`].
    pub fn connection_count(&self) -> i64 {
        self.conn_count.load(Ordering::SeqCst)
    }

    /// Stop the I/O loops and cancel every virtual connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Next newly-seen remote, as a virtual connection. `None` once the
    /// server is shut down.
    pub async fn accept(&self) -> Option<Arc<DatagramConn>> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            () = self.cancel.cancelled() => None,
            conn = accept_rx.recv() => conn,
        }
    }

    /// Accept virtual connections and run a receive loop for each until
    /// shutdown.
    pub async fn serve(self: Arc<Self>) -> Result<(), ServerError> {
        loop {
            let Some(conn) = self.accept().await else {
                return Ok(());
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.connection_loop(conn).await;
            });
        }
    }

    /// Materialise a virtual connection for `peer` without emitting it on
    /// the accept channel. Used for server-initiated sessions.
    pub fn virtual_conn(&self, peer: SocketAddr) -> Result<Arc<DatagramConn>, SessionError> {
        let conn = DatagramConn::virtual_conn(
            Arc::clone(&self.socket),
            self.local,
            peer,
            self.read_timeout,
            self.outbound_tx.clone(),
            self.evict_tx.clone(),
            &self.cancel,
        );
        self.sessions.insert(&peer.to_string(), Arc::clone(&conn))?;
        Ok(conn)
    }

    /// Queue `bytes` for delivery to an arbitrary address through the
    /// shared write loop.
    pub async fn send_to(&self, bytes: Vec<u8>, addr: SocketAddr) -> Result<(), ServerError> {
        self.outbound_tx
            .send((bytes, addr))
            .await
            .map_err(|_| ServerError::Net(NetError::Closed))
    }

    async fn connection_loop(&self, conn: Arc<DatagramConn>) {
        self.conn_count.fetch_add(1, Ordering::SeqCst);
        let conn_ref: ConnRef = conn.clone();
        tracing::debug!(conn = %conn_ref.label(), "udp session accepted");

        if let Some(on_connect) = &self.hooks.on_connect {
            on_connect(Arc::clone(&conn_ref));
        }
        if let Some(on_disconnect) = &self.hooks.on_disconnect {
            let hook = Arc::clone(on_disconnect);
            conn_ref.set_close_hook(Box::new(move |closing: &dyn Conn| hook(closing)));
        }

        loop {
            match conn_ref.read_packet().await {
                Ok(packet) => {
                    if self.spawn_dispatch {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let conn = Arc::clone(&conn_ref);
                        tokio::spawn(async move {
                            dispatcher.dispatch(packet, &conn).await;
                        });
                    } else {
                        self.dispatcher.dispatch(packet, &conn_ref).await;
                    }
                }
                Err(err) => {
                    tracing::debug!(conn = %conn_ref.label_short(), "udp session ended: {err}");
                    break;
                }
            }
        }

        self.conn_count.fetch_sub(1, Ordering::SeqCst);
        let _ = conn_ref.close().await;
        tracing::info!(conn = %conn_ref.label_short(), "udp session closed");
    }

    async fn read_loop(self: Arc<Self>, accept_tx: mpsc::Sender<Arc<DatagramConn>>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("udp read loop stopped");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, peer) = match received {
                Ok(received) => received,
                Err(err) => {
                    tracing::debug!("recv_from failed: {err}");
                    continue;
                }
            };
            let datagram = buf[..len].to_vec();
            let key = peer.to_string();

            if let Some(conn) = self.sessions.get(&key) {
                conn.push_datagram(datagram).await;
                continue;
            }

            let conn = DatagramConn::virtual_conn(
                Arc::clone(&self.socket),
                self.local,
                peer,
                self.read_timeout,
                self.outbound_tx.clone(),
                self.evict_tx.clone(),
                &self.cancel,
            );
            if let Err(err) = self.sessions.insert(&key, Arc::clone(&conn)) {
                tracing::debug!(%peer, "dropping datagram: {err}");
                continue;
            }
            if accept_tx.send(Arc::clone(&conn)).await.is_err() {
                tracing::debug!("accept channel closed, udp read loop stopped");
                return;
            }
            conn.push_datagram(datagram).await;
        }
    }

    async fn write_loop(self: Arc<Self>, mut outbound_rx: mpsc::Receiver<OutboundDatagram>) {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("udp write loop stopped");
                    return;
                }
                next = outbound_rx.recv() => next,
            };

            let Some((bytes, addr)) = next else { return };
            if let Err(err) = self.socket.send_to(&bytes, addr).await {
                tracing::warn!(%addr, "send_to failed: {err}");
                return;
            }
        }
    }

    async fn close_loop(self: Arc<Self>, mut evict_rx: mpsc::Receiver<String>) {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("udp close loop stopped");
                    return;
                }
                next = evict_rx.recv() => next,
            };

            let Some(key) = next else { return };
            self.sessions.remove(&key);
        }
    }
}
