//! Packet dispatcher: family demux, registered callbacks, default handlers.
//!
//! Every received packet flows through [`Dispatcher::dispatch`]. A packet
//! override replaces dispatch wholesale; otherwise the pre-hook may veto,
//! then the packet is demultiplexed by family to a registered callback or
//! the built-in default. Command packets additionally consult the
//! pending-call table first (client side), so synchronous invokes are woken
//! before any callback runs. Handler errors are logged and never terminate
//! the connection.

use std::sync::Arc;

use crosswire_proto::{
    AvPacket, CipherSuite, CmdPacket, CustomerPacket, FilePacket, HbPacket, MessageType, Packet,
    RpcKind,
};
use futures::future::BoxFuture;

use crate::{
    codec::{Encoding, Message},
    conn::{Conn, ConnRef, send_packet},
    error::{DispatchError, NetError},
    pending::PendingCalls,
    seq::next_cmd_seq,
    service::Service,
};

/// Wire result code: the command id had no registration on the responder.
pub const CMD_ID_NOT_REGISTERED: u64 = 1;

/// Veto hook run before family demux. Returning `false` stops dispatch.
pub type PreHook = Arc<dyn Fn(&Packet, &ConnRef) -> bool + Send + Sync>;

/// Wholesale replacement for built-in dispatch.
pub type PacketOverride = Arc<dyn Fn(Packet, ConnRef) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registered callback for one packet family.
pub type FamilyCallback<P> =
    Arc<dyn Fn(P, ConnRef) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync>;

/// Callback set configured on a server or client.
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Replaces built-in dispatch entirely when set.
    pub packet_override: Option<PacketOverride>,
    /// Runs ahead of family demux; `false` aborts dispatch.
    pub pre_hook: Option<PreHook>,
    /// Heartbeat packets.
    pub heartbeat: Option<FamilyCallback<HbPacket>>,
    /// Command packets (after the pending-call table).
    pub command: Option<FamilyCallback<CmdPacket>>,
    /// Media packets.
    pub media: Option<FamilyCallback<AvPacket>>,
    /// File chunk packets.
    pub file: Option<FamilyCallback<FilePacket>>,
    /// Customer packets.
    pub customer: Option<FamilyCallback<CustomerPacket>>,
}

/// Builds the decoder closure handed to command handlers. Captures the
/// payload by value so the handler keeps exclusive access to the packet.
fn decoder_for(
    cmd: &CmdPacket,
) -> impl Fn(&mut dyn Message) -> Result<(), DispatchError> + Send + Sync {
    let message_type = cmd.header.message_type;
    let code = cmd.code;
    let payload = cmd.payload.clone();
    move |target: &mut dyn Message| {
        if code != 0 {
            return Ok(());
        }
        let encoding = Encoding::for_message_type(message_type)?;
        target.merge(encoding, &payload)?;
        Ok(())
    }
}

/// Per-peer packet dispatcher.
pub struct Dispatcher {
    service: Arc<Service>,
    callbacks: Callbacks,
    pending: Option<Arc<PendingCalls>>,
    echo_heartbeat: bool,
}

impl Dispatcher {
    /// Dispatcher for an acceptor: heartbeats are echoed by default.
    pub fn server(service: Arc<Service>, callbacks: Callbacks) -> Self {
        Self { service, callbacks, pending: None, echo_heartbeat: true }
    }

    /// Dispatcher for an initiator: responses are routed through `pending`
    /// first, heartbeats are only logged.
    pub fn client(service: Arc<Service>, callbacks: Callbacks, pending: Arc<PendingCalls>) -> Self {
        Self { service, callbacks, pending: Some(pending), echo_heartbeat: false }
    }

    /// The service registry this dispatcher consults.
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Dispatch one received packet. Errors are logged here; the connection
    /// stays up.
    pub async fn dispatch(&self, packet: Packet, conn: &ConnRef) {
        if let Some(override_cb) = &self.callbacks.packet_override {
            override_cb(packet, Arc::clone(conn)).await;
            return;
        }

        if let Some(pre_hook) = &self.callbacks.pre_hook {
            if !pre_hook(&packet, conn) {
                return;
            }
        }

        let result = match packet {
            Packet::Heartbeat(hb) => self.dispatch_heartbeat(hb, conn).await,
            Packet::Cmd(cmd) => self.dispatch_cmd(cmd, conn).await,
            Packet::Av(av) => match &self.callbacks.media {
                Some(cb) => cb(av, Arc::clone(conn)).await,
                None => {
                    tracing::debug!(
                        conn = %conn.label_short(),
                        payload_len = av.payload.len(),
                        "AV packet without handler"
                    );
                    Ok(())
                }
            },
            Packet::Customer(customer) => match &self.callbacks.customer {
                Some(cb) => cb(customer, Arc::clone(conn)).await,
                None => {
                    tracing::debug!(
                        conn = %conn.label_short(),
                        payload_len = customer.payload.len(),
                        "CUSTOMER packet without handler"
                    );
                    Ok(())
                }
            },
            Packet::File(file) => match &self.callbacks.file {
                Some(cb) => cb(file, Arc::clone(conn)).await,
                None => {
                    tracing::debug!(
                        conn = %conn.label_short(),
                        file_id = file.file_id,
                        offset = file.offset,
                        "FILE packet without handler"
                    );
                    Ok(())
                }
            },
        };

        if let Err(err) = result {
            tracing::error!(conn = %conn.label_short(), "packet handler failed: {err}");
        }
    }

    async fn dispatch_heartbeat(
        &self,
        hb: HbPacket,
        conn: &ConnRef,
    ) -> Result<(), DispatchError> {
        if let Some(cb) = &self.callbacks.heartbeat {
            return cb(hb, Arc::clone(conn)).await;
        }

        if self.echo_heartbeat {
            send_packet(conn.as_ref(), &mut Packet::Heartbeat(HbPacket::new())).await?;
        } else {
            tracing::debug!(conn = %conn.label_short(), "heartbeat from peer");
        }
        Ok(())
    }

    async fn dispatch_cmd(&self, cmd: CmdPacket, conn: &ConnRef) -> Result<(), DispatchError> {
        // a synchronous invoke waiting on this sequence takes priority
        let cmd = match &self.pending {
            Some(pending) => match pending.complete(cmd) {
                Ok(()) => return Ok(()),
                Err(unclaimed) => unclaimed,
            },
            None => cmd,
        };

        if let Some(cb) = &self.callbacks.command {
            return cb(cmd, Arc::clone(conn)).await;
        }
        self.default_cmd(cmd, conn).await
    }

    /// Default command path: resolve the service, decode, invoke the
    /// handler, write back the reply.
    pub async fn default_cmd(
        &self,
        mut cmd: CmdPacket,
        conn: &ConnRef,
    ) -> Result<(), DispatchError> {
        let Some(desc) = self.service.get(cmd.cmd_id) else {
            let cmd_id = cmd.cmd_id;
            cmd.code = CMD_ID_NOT_REGISTERED;
            if cmd.rpc_kind == RpcKind::Request {
                cmd.rpc_kind = RpcKind::Response;
            }
            cmd.payload.clear();
            send_packet(conn.as_ref(), &mut Packet::Cmd(cmd)).await?;
            return Err(DispatchError::CmdNotRegistered(cmd_id));
        };

        cmd.cmd_name.clone_from(&desc.cmd_name);
        let cmd_id = cmd.cmd_id;
        let cmd_name = desc.cmd_name.clone();
        let was_request = cmd.rpc_kind == RpcKind::Request;

        let decoder = decoder_for(&cmd);
        let handler = if was_request { &desc.request_handler } else { &desc.response_handler };
        let reply = handler(desc.user_data.as_ref(), Some(conn), &mut cmd, true, &decoder)
            .map_err(|e| DispatchError::Handler(format!("cmd {cmd_id} ({cmd_name}): {e}")))?;

        if was_request {
            if let Some(reply) = reply {
                write_response(conn.as_ref(), &mut cmd, Some(reply.as_ref())).await?;
            }
        }
        Ok(())
    }
}

/// Encode `reply` per the packet's message type, flip the packet to a
/// response and write it to `conn`. With a non-zero `code` or no reply the
/// response goes out with an empty payload.
pub async fn write_response(
    conn: &dyn Conn,
    cmd: &mut CmdPacket,
    reply: Option<&dyn Message>,
) -> Result<(), DispatchError> {
    let mut payload = Vec::new();
    if cmd.code == 0 {
        if let Some(message) = reply {
            let encoding = Encoding::for_message_type(cmd.header.message_type)?;
            payload = message.encode(encoding)?;
        }
    }

    cmd.payload = payload;
    cmd.rpc_kind = RpcKind::Response;
    cmd.header.protocol = conn.transport().wire_protocol();
    let bytes = cmd.pack().map_err(NetError::from)?;
    conn.write(&bytes).await.map_err(DispatchError::Net)?;
    Ok(())
}

/// Fire-and-forget request on any connection, server or client side.
/// Allocates a fresh `cmd_seq` and returns it; any response takes the
/// callback path.
pub async fn invoke_async(
    conn: &dyn Conn,
    cmd_id: u64,
    req: &dyn Message,
    message_type: MessageType,
    suite: CipherSuite,
) -> Result<u64, DispatchError> {
    let cmd_seq = next_cmd_seq();
    let mut cmd = CmdPacket::new(message_type);
    cmd.cmd_seq = cmd_seq;
    cmd.cmd_id = cmd_id;
    cmd.suite = suite;
    cmd.payload = req.encode(Encoding::for_message_type(message_type)?)?;
    cmd.header.protocol = conn.transport().wire_protocol();

    let bytes = cmd.pack().map_err(NetError::from)?;
    conn.write(&bytes).await.map_err(DispatchError::Net)?;
    Ok(cmd_seq)
}

/// Decode a command packet against a registry without a connection, e.g.
/// for captured traffic or application-level queues.
pub fn decode_packet(
    cmd: &mut CmdPacket,
    service: &Service,
) -> Result<Option<Box<dyn Message>>, DispatchError> {
    let Some(desc) = service.get(cmd.cmd_id) else {
        return Err(DispatchError::CmdNotRegistered(cmd.cmd_id));
    };

    cmd.cmd_name.clone_from(&desc.cmd_name);
    let cmd_id = cmd.cmd_id;
    let cmd_name = desc.cmd_name.clone();

    let decoder = decoder_for(cmd);
    let handler = match cmd.rpc_kind {
        RpcKind::Request => &desc.request_handler,
        RpcKind::Response => &desc.response_handler,
    };
    handler(desc.user_data.as_ref(), None, cmd, false, &decoder)
        .map_err(|e| DispatchError::Handler(format!("cmd {cmd_id} ({cmd_name}): {e}")))
}
