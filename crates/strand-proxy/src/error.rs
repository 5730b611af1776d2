//! Error types for the proxy layer.

use crate::event::{ObserverId, ProxyId};
use crate::proxy::ProxyKind;
use strand_core::CrdtError;
use thiserror::Error;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Unknown cursor: {0}")]
    UnknownCursor(u64),

    #[error("Request rejected by the store: {0}")]
    Rejected(String),
}

/// Errors raised by proxies and the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Proxy '{proxy}' received a malformed update: {reason}")]
    MalformedUpdate { proxy: ProxyId, reason: String },

    #[error("Observer '{observer}' is already registered with proxy '{proxy}'")]
    AlreadyRegistered { proxy: ProxyId, observer: ObserverId },

    #[error("Unknown proxy: {0}")]
    UnknownProxy(ProxyId),

    #[error("Proxy '{proxy}' is a {found} proxy, not a {expected} proxy")]
    KindMismatch {
        proxy: ProxyId,
        expected: ProxyKind,
        found: ProxyKind,
    },

    #[error("Page size must be a positive integer")]
    InvalidPageSize,

    #[error("Engine inbox is already being drained")]
    InboxBusy,
}

/// Error returned by observer callbacks.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
