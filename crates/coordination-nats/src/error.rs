use thiserror::Error;
use wire_coordination::CoordinationError;

/// Errors that can occur when using the NATS coordination adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// A JetStream KV operation failed.
    #[error("NATS KV {operation} failed: {message}")]
    Kv {
        /// The operation that failed.
        operation: &'static str,
        /// The underlying error message.
        message: String,
    },

    /// A stored record could not be decoded.
    #[error("invalid record stored under {key}: {source}")]
    InvalidRecord {
        /// The key the record was stored under.
        key: String,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be encoded.
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    /// Operation timed out.
    #[error("NATS KV {0} timed out")]
    Timeout(&'static str),
}

impl Error {
    pub(crate) fn kv(operation: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Kv {
            operation,
            message: error.to_string(),
        }
    }
}

impl CoordinationError for Error {}
