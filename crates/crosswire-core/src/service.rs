//! Service registry: command ids mapped to handler pairs.
//!
//! A [`ServiceDesc`] binds a command id to its human name, a request
//! handler, a response handler and optional handler-owned data. Handlers
//! follow the generated-stub shape: they receive the user data, the
//! connection the packet arrived on (absent for offline decoding), the
//! packet itself, a run-mode flag (`true` from the dispatcher, `false` from
//! a synchronous invoke) and a decoder closure that materialises the payload
//! into a typed message. Request handlers return the response message to
//! write back; response handlers return the decoded message for the caller.

use std::{any::Any, sync::Arc};

use dashmap::DashMap;

use crate::{
    codec::Message,
    conn::ConnRef,
    error::DispatchError,
};

/// Handler-owned opaque state, passed back on every invocation.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Decoder closure handed to handlers; decodes the packet payload into the
/// given message under the packet's encoding. A no-op when the packet
/// carries a non-zero result code.
pub type DecodeFn<'a> = &'a (dyn Fn(&mut dyn Message) -> Result<(), DispatchError> + Send + Sync);

/// Erased command handler.
///
/// Arguments: user data, connection (if any), packet, run-mode flag,
/// decoder. Returns the message to hand onward: a response to write (request
/// handlers on the dispatch path) or the decoded payload (response handlers
/// on the invoke path).
pub type CmdHandler = Arc<
    dyn Fn(
            Option<&UserData>,
            Option<&ConnRef>,
            &mut crosswire_proto::CmdPacket,
            bool,
            DecodeFn<'_>,
        ) -> Result<Option<Box<dyn Message>>, DispatchError>
        + Send
        + Sync,
>;

/// Registration record for one command id.
#[derive(Clone)]
pub struct ServiceDesc {
    /// Command id, unique within a registry.
    pub cmd_id: u64,
    /// Human name, stamped onto dispatched packets for logs.
    pub cmd_name: String,
    /// Invoked for incoming requests.
    pub request_handler: CmdHandler,
    /// Invoked for incoming responses.
    pub response_handler: CmdHandler,
    /// Handler-owned state.
    pub user_data: Option<UserData>,
}

impl ServiceDesc {
    /// Descriptor without user data.
    pub fn new(
        cmd_id: u64,
        cmd_name: impl Into<String>,
        request_handler: CmdHandler,
        response_handler: CmdHandler,
    ) -> Self {
        Self { cmd_id, cmd_name: cmd_name.into(), request_handler, response_handler, user_data: None }
    }
}

/// Response handler that decodes the payload into `T` and returns it.
///
/// The common client-side registration: the invoke path downcasts the
/// returned box back to `T`.
pub fn decode_response<T>() -> CmdHandler
where
    T: Message + Default,
{
    Arc::new(
        |_user_data: Option<&UserData>,
         _conn: Option<&ConnRef>,
         _packet: &mut crosswire_proto::CmdPacket,
         _run: bool,
         decode: DecodeFn<'_>| {
            let mut message = T::default();
            decode(&mut message)?;
            Ok(Some(Box::new(message) as Box<dyn Message>))
        },
    )
}

/// Request handler that decodes the payload into `Req` before calling `f`.
///
/// `f` receives the user data, the connection, the packet (for result codes
/// and correlation fields) and the decoded request; whatever it returns is
/// written back as the response by the dispatcher.
pub fn handle_request<Req, F>(f: F) -> CmdHandler
where
    Req: Message + Default,
    F: Fn(
            Option<&UserData>,
            Option<&ConnRef>,
            &mut crosswire_proto::CmdPacket,
            Req,
        ) -> Result<Option<Box<dyn Message>>, DispatchError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(
        move |user_data: Option<&UserData>,
              conn: Option<&ConnRef>,
              packet: &mut crosswire_proto::CmdPacket,
              _run: bool,
              decode: DecodeFn<'_>| {
            let mut req = Req::default();
            decode(&mut req)?;
            f(user_data, conn, packet, req)
        },
    )
}

/// Handler that ignores the packet entirely (e.g. fire-and-forget requests
/// whose responses carry no payload worth decoding).
pub fn ignore_packet() -> CmdHandler {
    Arc::new(
        |_user_data: Option<&UserData>,
         _conn: Option<&ConnRef>,
         _packet: &mut crosswire_proto::CmdPacket,
         _run: bool,
         _decode: DecodeFn<'_>| Ok(None),
    )
}

/// Thread-safe registry of command descriptors. Readers never block
/// writers; later registrations overwrite earlier ones.
#[derive(Default)]
pub struct Service {
    cmds: DashMap<u64, Arc<ServiceDesc>>,
}

impl Service {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `desc`, attaching `user_data`. Overwrites any existing
    /// registration for the same command id.
    pub fn register(&self, mut desc: ServiceDesc, user_data: Option<UserData>) {
        desc.user_data = user_data;
        self.cmds.insert(desc.cmd_id, Arc::new(desc));
    }

    /// Remove the registration for `cmd_id`.
    pub fn unregister(&self, cmd_id: u64) {
        self.cmds.remove(&cmd_id);
    }

    /// Look up the descriptor for `cmd_id`.
    pub fn get(&self, cmd_id: u64) -> Option<Arc<ServiceDesc>> {
        self.cmds.get(&cmd_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(cmd_id: u64, name: &str) -> ServiceDesc {
        ServiceDesc::new(cmd_id, name, ignore_packet(), ignore_packet())
    }

    #[test]
    fn register_and_get() {
        let service = Service::new();
        service.register(desc(7, "Echo"), None);

        let found = service.get(7).unwrap();
        assert_eq!(found.cmd_name, "Echo");
        assert_eq!(service.len(), 1);
        assert!(service.get(8).is_none());
    }

    #[test]
    fn later_registration_overwrites() {
        let service = Service::new();
        service.register(desc(7, "Echo"), None);
        service.register(desc(7, "EchoV2"), None);

        assert_eq!(service.get(7).unwrap().cmd_name, "EchoV2");
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn unregister_removes() {
        let service = Service::new();
        service.register(desc(7, "Echo"), None);
        service.unregister(7);
        assert!(service.get(7).is_none());
        assert!(service.is_empty());
    }

    #[test]
    fn user_data_is_attached() {
        let service = Service::new();
        service.register(desc(9, "Stateful"), Some(Arc::new(42u32)));

        let found = service.get(9).unwrap();
        let data = found.user_data.as_ref().unwrap();
        assert_eq!(*data.downcast_ref::<u32>().unwrap(), 42);
    }
}
