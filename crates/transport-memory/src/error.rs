use std::time::Duration;

use thiserror::Error;
use wire_transport::subject::SubjectError;
use wire_transport::{SubscriptionId, TransportError};

/// Errors that can occur in the in-memory transport.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The transport was closed.
    #[error("transport closed")]
    Closed,

    /// The subject is not valid for the operation.
    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),

    /// A request found no subscriber to answer it.
    #[error("no responders for subject '{0}'")]
    NoResponders(String),

    /// A request was not answered in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The subscription does not exist (or was already removed).
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
}

impl TransportError for Error {}
