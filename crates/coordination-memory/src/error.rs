use thiserror::Error;
use wire_coordination::CoordinationError;

/// Errors that can occur in the in-memory coordination adapter.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The adapter was closed.
    #[error("coordination adapter closed")]
    Closed,
}

impl CoordinationError for Error {}
