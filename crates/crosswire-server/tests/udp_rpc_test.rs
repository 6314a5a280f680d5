//! End-to-end UDP scenarios: invoke round trips over virtual connections,
//! preamble rejection, session bounds, and timeout semantics.

use std::{sync::Arc, time::Duration};

use crosswire_client::{InvokeError, UdpClient, UdpClientConfig};
use crosswire_core::{
    Callbacks, Conn, ConnState, Service, ServiceDesc, decode_response, handle_request,
};
use crosswire_proto::{HbPacket, Protocol, RpcKind};
use crosswire_server::{ServerHooks, UdpServer, UdpServerConfig};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
struct EchoMsg {
    text: String,
}

const ECHO_CMD: u64 = 7;

fn echo_service() -> Arc<Service> {
    let service = Arc::new(Service::new());
    service.register(
        ServiceDesc::new(
            ECHO_CMD,
            "Echo",
            handle_request::<EchoMsg, _>(|_, _, _, req| Ok(Some(Box::new(req)))),
            decode_response::<EchoMsg>(),
        ),
        None,
    );
    service
}

async fn spawn_server(
    max_sessions: i64,
    callbacks: Callbacks,
    hooks: ServerHooks,
) -> Arc<UdpServer> {
    let server = UdpServer::bind(
        UdpServerConfig::new("127.0.0.1", 0, max_sessions),
        echo_service(),
        callbacks,
        hooks,
    )
    .await
    .expect("bind");

    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    server
}

fn udp_heartbeat() -> Vec<u8> {
    let mut hb = HbPacket::new();
    hb.header.protocol = Protocol::Udp;
    hb.pack().expect("pack")
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test]
async fn invoke_round_trip_over_virtual_connection() {
    let server = spawn_server(0, Callbacks::default(), ServerHooks::default()).await;

    let client = UdpClient::dial(
        UdpClientConfig::new(server.local_addr().to_string()),
        echo_service(),
        Callbacks::default(),
        None,
    )
    .await
    .expect("dial");
    assert_eq!(client.state(), ConnState::Connected);

    let cancel = CancellationToken::new();
    let (response, decoded) = client
        .invoke(&cancel, ECHO_CMD, &EchoMsg { text: "over udp".into() })
        .await
        .expect("invoke");

    assert_eq!(response.rpc_kind, RpcKind::Response);
    assert_eq!(response.code, 0);
    assert_eq!(response.header.protocol, Protocol::Udp);

    let echo = decoded.expect("decoded").into_any().downcast::<EchoMsg>().expect("EchoMsg");
    assert_eq!(echo.text, "over udp");

    assert_eq!(server.session_count(), 1);

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn bad_preamble_is_rejected_and_not_dispatched() {
    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::channel(4);
    let callbacks = Callbacks {
        command: Some(Arc::new(move |cmd, _conn| {
            let cmd_tx = cmd_tx.clone();
            Box::pin(async move {
                let _ = cmd_tx.send(cmd).await;
                Ok(())
            })
        })),
        ..Callbacks::default()
    };
    let server = spawn_server(0, callbacks, ServerHooks::default()).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    socket.send_to(&[0xDE, 0xAD, 0xBE, 0xEF], server.local_addr()).await.expect("send");

    // the mangled datagram tears its transient session down again
    let sessions = Arc::clone(&server);
    assert!(
        wait_for(move || sessions.session_count() == 0, Duration::from_secs(2)).await,
        "session table should end up unchanged"
    );
    assert!(cmd_rx.try_recv().is_err(), "nothing may reach dispatch");

    server.shutdown();
}

#[tokio::test]
async fn session_bound_drops_excess_peers() {
    let server = spawn_server(1, Callbacks::default(), ServerHooks::default()).await;
    let addr = server.local_addr();

    let first = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    first.send_to(&udp_heartbeat(), addr).await.expect("send");

    let sessions = Arc::clone(&server);
    assert!(
        wait_for(move || sessions.session_count() == 1, Duration::from_secs(2)).await,
        "first peer should claim the only session"
    );

    let second = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    second.send_to(&udp_heartbeat(), addr).await.expect("send");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(server.session_count(), 1, "second peer must be dropped at the bound");

    // the first peer still gets served: the heartbeat echo comes back
    let mut buf = [0u8; 64];
    let (n, from) =
        tokio::time::timeout(Duration::from_secs(2), first.recv_from(&mut buf))
            .await
            .expect("echo within deadline")
            .expect("recv");
    assert_eq!(from, addr);
    assert_eq!(&buf[..n], udp_heartbeat().as_slice());

    server.shutdown();
}

#[tokio::test]
async fn invoke_timeout_keeps_the_connection_open() {
    // server that swallows every packet
    let callbacks = Callbacks {
        packet_override: Some(Arc::new(|_packet, _conn| Box::pin(async {}))),
        ..Callbacks::default()
    };
    let server = spawn_server(0, callbacks, ServerHooks::default()).await;

    let mut config = UdpClientConfig::new(server.local_addr().to_string());
    config.invoke_timeout = Duration::from_millis(100);
    let client = UdpClient::dial(config, echo_service(), Callbacks::default(), None)
        .await
        .expect("dial");

    let cancel = CancellationToken::new();
    let err = client.invoke(&cancel, ECHO_CMD, &EchoMsg::default()).await.unwrap_err();
    assert!(matches!(err, InvokeError::Timeout(_)), "got {err}");

    // unlike TCP, the datagram connection survives the timeout
    assert_eq!(client.state(), ConnState::Connected);

    let err = client.invoke(&cancel, ECHO_CMD, &EchoMsg::default()).await.unwrap_err();
    assert!(matches!(err, InvokeError::Timeout(_)), "still timing out, not disconnected");

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn virtual_conn_is_not_emitted_on_accept() {
    // no serve loop here: the accept channel must stay observable
    let server = UdpServer::bind(
        UdpServerConfig::new("127.0.0.1", 0, 0),
        echo_service(),
        Callbacks::default(),
        ServerHooks::default(),
    )
    .await
    .expect("bind");

    let remote = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let remote_addr = remote.local_addr().expect("addr");

    let conn = server.virtual_conn(remote_addr).expect("materialise");
    assert_eq!(server.session_count(), 1);

    let accepted = tokio::time::timeout(Duration::from_millis(200), server.accept()).await;
    assert!(accepted.is_err(), "materialised sessions must not surface via accept");

    // outbound writes flow through the shared write loop to the peer
    conn.write(&udp_heartbeat()).await.expect("write");
    let mut buf = [0u8; 64];
    let (n, from) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
        .await
        .expect("delivery within deadline")
        .expect("recv");
    assert_eq!(from, server.local_addr());
    assert_eq!(&buf[..n], udp_heartbeat().as_slice());

    // direct sends share the same path
    server.send_to(udp_heartbeat(), remote_addr).await.expect("send_to");
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
        .await
        .expect("delivery within deadline")
        .expect("recv");
    assert_eq!(&buf[..n], udp_heartbeat().as_slice());

    // closing evicts the session without touching the shared socket
    conn.close().await.expect("close");
    let sessions = Arc::clone(&server);
    assert!(
        wait_for(move || sessions.session_count() == 0, Duration::from_secs(2)).await,
        "eviction should empty the table"
    );

    server.shutdown();
}

#[tokio::test]
async fn cancellation_aborts_invoke_without_closing() {
    let callbacks = Callbacks {
        packet_override: Some(Arc::new(|_packet, _conn| Box::pin(async {}))),
        ..Callbacks::default()
    };
    let server = spawn_server(0, callbacks, ServerHooks::default()).await;

    let client = UdpClient::dial(
        UdpClientConfig::new(server.local_addr().to_string()),
        echo_service(),
        Callbacks::default(),
        None,
    )
    .await
    .expect("dial");

    let cancel = CancellationToken::new();
    let aborter = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        aborter.cancel();
    });

    let err = client.invoke(&cancel, ECHO_CMD, &EchoMsg::default()).await.unwrap_err();
    assert!(matches!(err, InvokeError::Cancelled), "got {err}");
    assert_eq!(client.state(), ConnState::Connected);

    client.close().await;
    server.shutdown();
}
