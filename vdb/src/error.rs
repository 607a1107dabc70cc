use std::io;
use thiserror::Error;

/// Errors produced by the transport.
///
/// Setup failures (`SharedMemory`, `Channel` during creation, `Config`,
/// `Spawn`) disable instrumentation; everything else is absorbed by the
/// worker that owns it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("shared memory mapping failed: {0}")]
    SharedMemory(#[source] io::Error),

    #[error("flow-control channel failed: {0}")]
    Channel(#[source] io::Error),

    #[error("flow-control channel closed")]
    ChannelClosed,

    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("transmission made no progress")]
    ZeroProgress,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to spawn {role} worker: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{role} worker did not acknowledge startup")]
    NoAck { role: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors from the WebSocket protocol layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake request is not a valid HTTP upgrade request")]
    BadRequest,

    #[error("handshake request has no Sec-WebSocket-Key header")]
    MissingKey,

    #[error("handshake response rejected: {0}")]
    BadResponse(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
