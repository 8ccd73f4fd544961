use std::time::Duration;

use thiserror::Error;
use wire_transport::subject::SubjectError;
use wire_transport::{SubscriptionId, TransportError};

/// Errors that can occur in the NATS transport.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport was closed.
    #[error("transport closed")]
    Closed,

    /// Could not connect to the NATS server.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// Flushing buffered messages failed.
    #[error("failed to flush: {0}")]
    Flush(String),

    /// The subject is not valid for the operation.
    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),

    /// A request found no subscriber to answer it.
    #[error("no responders for subject '{0}'")]
    NoResponders(String),

    /// An operation was attempted before `connect`.
    #[error("transport not connected")]
    NotConnected,

    /// Publishing failed.
    #[error("failed to publish: {0}")]
    Publish(String),

    /// A request failed for a reason other than timeout or missing responders.
    #[error("request failed: {0}")]
    Request(String),

    /// Subscribing failed.
    #[error("failed to subscribe: {0}")]
    Subscribe(String),

    /// A request was not answered in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The subscription does not exist (or was already removed).
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
}

impl TransportError for Error {}
