//! TCP/TLS server: accept loop plus per-connection receive loops.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use crosswire_core::{Callbacks, Conn, ConnRef, Dispatcher, Service, StreamConn, Transport};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{ServerError, ServerHooks};

/// Configuration for [`TcpServer::bind`].
#[derive(Clone)]
pub struct TcpServerConfig {
    /// Listen URL, scheme `tcp` or `tls` (e.g. `tcp://0.0.0.0:9000`).
    pub url: String,
    /// TLS context; required for the `tls` scheme.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Read deadline applied before every packet read.
    pub read_timeout: Duration,
    /// Dispatch each packet on a fresh task instead of inline.
    pub spawn_dispatch: bool,
}

impl TcpServerConfig {
    /// Defaults for `url`: 180 s read deadline, inline dispatch.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tls: None,
            read_timeout: Duration::from_secs(180),
            spawn_dispatch: false,
        }
    }
}

/// Stream server for `tcp://` and `tls://` endpoints.
pub struct TcpServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
    hooks: ServerHooks,
    read_timeout: Duration,
    spawn_dispatch: bool,
    conn_count: Arc<AtomicI64>,
    cancel: CancellationToken,
}

impl TcpServer {
    /// Bind the listen socket described by `config`.
    pub async fn bind(
        config: TcpServerConfig,
        service: Arc<Service>,
        callbacks: Callbacks,
        hooks: ServerHooks,
    ) -> Result<Self, ServerError> {
        let url = Url::parse(&config.url)
            .map_err(|e| ServerError::Config(format!("invalid url {}: {e}", config.url)))?;

        let acceptor = match url.scheme() {
            "tcp" => None,
            "tls" => {
                let tls = config
                    .tls
                    .clone()
                    .ok_or_else(|| ServerError::Config("tls scheme requires a TLS config".into()))?;
                Some(TlsAcceptor::from(tls))
            }
            other => return Err(ServerError::Config(format!("unsupported scheme: {other}"))),
        };

        let host = url
            .host_str()
            .ok_or_else(|| ServerError::Config(format!("missing host in {}", config.url)))?;
        let port = url
            .port()
            .ok_or_else(|| ServerError::Config(format!("missing port in {}", config.url)))?;

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| ServerError::Transport(format!("bind {host}:{port}: {e}")))?;

        Ok(Self {
            listener,
            acceptor,
            dispatcher: Arc::new(Dispatcher::server(service, callbacks)),
            hooks,
            read_timeout: config.read_timeout,
            spawn_dispatch: config.spawn_dispatch,
            conn_count: Arc::new(AtomicI64::new(0)),
            cancel: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(|e| ServerError::Transport(e.to_string()))
    }

    /// Connections currently being served.
    pub fn connection_count(&self) -> i64 {
        self.conn_count.load(Ordering::SeqCst)
    }

    /// Stop accepting; live connection loops end on their next read.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accept connections until [`TcpServer::shutdown`].
    pub async fn serve(&self) -> Result<(), ServerError> {
        tracing::info!(addr = %self.local_addr()?, "tcp server serving");
        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let acceptor = self.acceptor.clone();
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let hooks = self.hooks.clone();
                    let conn_count = Arc::clone(&self.conn_count);
                    let read_timeout = self.read_timeout;
                    let spawn_dispatch = self.spawn_dispatch;
                    let cancel = self.cancel.clone();

                    tokio::spawn(async move {
                        let Some(conn) = establish(stream, peer, acceptor).await else {
                            return;
                        };
                        connection_loop(
                            conn,
                            dispatcher,
                            hooks,
                            conn_count,
                            read_timeout,
                            spawn_dispatch,
                            cancel,
                        )
                        .await;
                    });
                }
                Err(err) => {
                    tracing::warn!("accept failed: {err}");
                }
            }
        }
    }
}

/// Wrap an accepted stream, running the TLS handshake when configured.
async fn establish(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) -> Option<ConnRef> {
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(err) => {
            tracing::warn!(%peer, "accepted socket unusable: {err}");
            return None;
        }
    };

    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Some(StreamConn::new(tls_stream, local, peer, Transport::Tls)),
            Err(err) => {
                tracing::warn!(%peer, "tls handshake failed: {err}");
                None
            }
        },
        None => Some(StreamConn::new(stream, local, peer, Transport::Tcp)),
    }
}

async fn connection_loop(
    conn: ConnRef,
    dispatcher: Arc<Dispatcher>,
    hooks: ServerHooks,
    conn_count: Arc<AtomicI64>,
    read_timeout: Duration,
    spawn_dispatch: bool,
    server_cancel: CancellationToken,
) {
    conn_count.fetch_add(1, Ordering::SeqCst);
    tracing::debug!(conn = %conn.label(), "connection accepted");

    if let Some(on_connect) = &hooks.on_connect {
        on_connect(Arc::clone(&conn));
    }
    if let Some(on_disconnect) = &hooks.on_disconnect {
        let hook = Arc::clone(on_disconnect);
        conn.set_close_hook(Box::new(move |closing: &dyn Conn| hook(closing)));
    }

    loop {
        conn.set_read_timeout(read_timeout);
        let packet = tokio::select! {
            () = server_cancel.cancelled() => break,
            result = conn.read_packet() => match result {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::debug!(conn = %conn.label_short(), "receive loop ended: {err}");
                    break;
                }
            },
        };

        if spawn_dispatch {
            let dispatcher = Arc::clone(&dispatcher);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                dispatcher.dispatch(packet, &conn).await;
            });
        } else {
            dispatcher.dispatch(packet, &conn).await;
        }
    }

    conn_count.fetch_sub(1, Ordering::SeqCst);
    let _ = conn.close().await;
    tracing::debug!(conn = %conn.label(), "connection closed");
}
