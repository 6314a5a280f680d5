//! Transport and dispatch error types.

use std::time::Duration;

use crosswire_proto::FrameError;
use thiserror::Error;

use crate::codec::CodecError;

/// Errors from connection I/O.
#[derive(Debug, Error)]
pub enum NetError {
    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,

    /// The read deadline elapsed before a packet arrived.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// Dialing the peer failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Writing to the transport failed.
    #[error("write failed: {0}")]
    Write(String),

    /// Reading from the transport failed.
    #[error("read failed: {0}")]
    Read(String),

    /// The operation was cancelled by the connection's token.
    #[error("operation cancelled")]
    Cancelled,

    /// The bytes on the wire did not form a valid packet.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Errors from packet dispatch and command handling.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No service is registered for the command id. The dispatcher recovers
    /// by answering with `code = 1`; the error records the event for logs.
    #[error("command {0} is not registered")]
    CmdNotRegistered(u64),

    /// Payload encode/decode failure, including unsupported encodings.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A registered handler returned an error. Logged, never fatal to the
    /// connection.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Writing a reply back to the peer failed.
    #[error(transparent)]
    Net(#[from] NetError),
}
