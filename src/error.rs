use thiserror::Error;

use crate::protocol::{CodecError, TransportError};

/// Errors surfaced to users of the client API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server failed to execute a batch; carries its message verbatim.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid range: from {from} to {to}")]
    InvalidRange { from: String, to: String },

    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("scan aborted: background fetch panicked")]
    ScanAborted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
