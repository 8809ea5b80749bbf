//! Error types for transfer operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while sending or receiving a file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Transport could not be established.
    #[error("could not connect to {addr} after {attempts} attempt(s): {source}")]
    ConnectionFailed {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Handshake (or ack) could not be decoded.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    /// Digest algorithm name is unknown.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Declared path cannot be placed under the storage root.
    #[error("unsafe destination path {path:?}: {reason}")]
    UnsafePath { path: String, reason: &'static str },

    /// Bytes streamed by the sender differ from the declared size.
    #[error("size mismatch: declared {declared} bytes, sent {sent}")]
    SizeMismatch { declared: u64, sent: u64 },

    /// Stream closed before the declared size arrived.
    #[error("truncated transfer: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    /// Received payload does not hash to the declared digest.
    #[error("digest mismatch for {path:?}: declared {declared}, computed {computed}")]
    DigestMismatch {
        path: PathBuf,
        declared: String,
        computed: String,
    },

    /// A read or write did not complete in time, or the peer went away.
    #[error("transfer aborted: {0}")]
    TransferAborted(String),

    /// The receiver refused the transfer.
    #[error("rejected by receiver: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;
