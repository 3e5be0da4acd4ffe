//! Error types for the session engine.

use std::io;

use thiserror::Error;

/// Errors raised while loading TLS material or negotiating a handshake.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load certificate {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("TLS negotiation details missing: {0}")]
    ProtocolInfoMissing(&'static str),

    #[error("connection is already secured")]
    AlreadySecured,

    #[error("listener has no TLS context")]
    MissingContext,

    #[error(transparent)]
    Rustls(#[from] tokio_rustls::rustls::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Fatal session conditions. Protocol-level refusals are replies, not
/// errors; these are the conditions that end the session without one.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] TlsError),

    #[error("collaborator channel closed")]
    PeerGone,

    #[error("session timed out")]
    Timeout,
}
