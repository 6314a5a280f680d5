//! Synchronous invoke shared by the TCP and UDP clients.
//!
//! Builds the request packet, parks a one-shot slot in the pending-call
//! table, writes the request and waits on the first of: the matching
//! response, the caller's cancellation token, the invoke timeout. The slot
//! is removed on every exit path by its drop guard. The transports differ
//! only in what a timeout does to the connection: TCP tears it down (the
//! dial loop reconnects), UDP leaves it alone.

use std::{sync::Arc, time::Duration};

use crosswire_core::{
    CodecError, Conn, ConnRef, ConnState, DispatchError, Encoding, Message, NetError,
    PendingCalls, Service, decode_packet, next_cmd_seq, send_packet,
};
use crosswire_proto::{CipherSuite, CmdPacket, MessageType, Packet};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by `invoke` / `invoke_async`.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The client is not in the `Connected` state.
    #[error("connection state {0:?}, cannot invoke")]
    NotConnected(ConnState),

    /// No response arrived within the invoke timeout.
    #[error("invoke timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired while waiting.
    #[error("invoke cancelled")]
    Cancelled,

    /// Transport failure while sending the request.
    #[error(transparent)]
    Net(#[from] NetError),

    /// Response decoding failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Request encoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Wire parameters for one invoke.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InvokeParams {
    pub message_type: MessageType,
    pub suite: CipherSuite,
    pub timeout: Duration,
    /// Close the connection when the invoke times out (TCP semantics).
    pub close_on_timeout: bool,
}

pub(crate) fn build_request(
    cmd_id: u64,
    req: &dyn Message,
    params: InvokeParams,
) -> Result<CmdPacket, InvokeError> {
    let mut cmd = CmdPacket::new(params.message_type);
    cmd.cmd_seq = next_cmd_seq();
    cmd.cmd_id = cmd_id;
    cmd.suite = params.suite;
    cmd.payload = req.encode(Encoding::for_message_type(params.message_type)?)?;
    Ok(cmd)
}

/// Send `req` and wait for the matching response.
///
/// Returns the response packet plus whatever the registered response
/// handler produced. A non-zero `code` on the returned packet signals an
/// application-level failure; the handler is still consulted so typed
/// defaults come back.
pub(crate) async fn invoke_sync(
    conn: &ConnRef,
    pending: &Arc<PendingCalls>,
    service: &Service,
    cancel: &CancellationToken,
    cmd_id: u64,
    req: &dyn Message,
    params: InvokeParams,
) -> Result<(CmdPacket, Option<Box<dyn Message>>), InvokeError> {
    let cmd = build_request(cmd_id, req, params)?;
    let cmd_seq = cmd.cmd_seq;

    // slot guard removes the entry on every exit path below
    let (_slot, mut response_rx) = PendingCalls::register(pending, cmd_seq);

    let mut packet = Packet::Cmd(cmd);
    send_packet(conn.as_ref(), &mut packet).await?;

    tokio::select! {
        response = response_rx.recv() => match response {
            Some(mut response) => {
                let decoded = decode_packet(&mut response, service)?;
                Ok((response, decoded))
            }
            None => Err(InvokeError::Cancelled),
        },
        () = cancel.cancelled() => Err(InvokeError::Cancelled),
        () = tokio::time::sleep(params.timeout) => {
            if params.close_on_timeout {
                tracing::warn!(
                    cmd_id,
                    cmd_seq,
                    "invoke timed out after {:?}, closing connection",
                    params.timeout
                );
                let _ = conn.close().await;
            } else {
                tracing::warn!(cmd_id, cmd_seq, "invoke timed out after {:?}", params.timeout);
            }
            Err(InvokeError::Timeout(params.timeout))
        }
    }
}

/// Fire-and-forget: send the request without parking a slot. Any response
/// takes the callback path.
pub(crate) async fn invoke_fire_and_forget(
    conn: &ConnRef,
    cmd_id: u64,
    req: &dyn Message,
    params: InvokeParams,
) -> Result<u64, InvokeError> {
    let cmd = build_request(cmd_id, req, params)?;
    let cmd_seq = cmd.cmd_seq;
    let mut packet = Packet::Cmd(cmd);
    send_packet(conn.as_ref(), &mut packet).await?;
    Ok(cmd_seq)
}
