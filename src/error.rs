use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecError;
use crate::lookup::LookupError;
use crate::mqtt_listener::ListenerKind;

/// Service-level failures surfaced to the embedding host.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to bind {kind} listener on {addr}")]
    Bind {
        kind: ListenerKind,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build {name} thread pool")]
    Runtime {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS material: {0}")]
    Tls(String),

    #[error("service has already been started")]
    AlreadyStarted,

    #[error("service has been closed")]
    Closed,

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Why a session ended before or after its broker leg became ready.
///
/// Cloneable so a single failure can be observed by every waiter on a
/// readiness signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("failed to connect to broker {addr}: {reason}")]
    BrokerConnect { addr: SocketAddr, reason: String },

    #[error("broker refused the connection: {0}")]
    Refused(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("broker connection closed unexpectedly")]
    TransportLost,

    #[error("no broker available: {0}")]
    Lookup(String),

    #[error("broker handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("session closed")]
    Closed,
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// Returned when writing to a leg whose transport is already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel to {peer} is closed")]
pub struct ChannelClosed {
    pub peer: SocketAddr,
}
