use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;
use wire_coordination::CoordinationError;
use wire_transport::TransportError;

/// A boxed, thread-safe error.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors that can occur while sending or receiving messages.
#[derive(Debug, Error)]
pub enum Error {
    /// `start` was called on a receiver that is not stopped.
    #[error("already running")]
    AlreadyRunning,

    /// The coordination store failed.
    #[error("coordination error: {0}")]
    Coordination(#[source] BoxError),

    /// `on_message` was called more than once for a topic.
    #[error("message handler already registered for topic '{0}'")]
    HandlerAlreadyRegistered(String),

    /// The topic cannot be embedded into a subject.
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic {
        /// The rejected topic.
        topic: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The sender already has the maximum number of messages in flight.
    #[error("max in-flight messages exceeded ({0})")]
    MaxInFlightExceeded(usize),

    /// Topic setup finished without registering a message handler.
    #[error("no message handler registered for topic '{0}'")]
    NoMessageHandler(String),

    /// No live receiver could be found to own the topic.
    #[error("No receiver available for topic '{0}'")]
    NoReceiverAvailable(String),

    /// The component is not running (or was closed).
    #[error("not running")]
    NotRunning,

    /// Too many messages are queued while a topic is being set up.
    #[error("pending message queue full for topic '{0}'")]
    PendingQueueFull(String),

    /// Every retry attempt failed.
    #[error("{context} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// What was being attempted.
        context: String,
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        source: Box<Self>,
    },

    /// No terminal response arrived before the (possibly extended) deadline.
    #[error("timed out after {timeout:?} waiting for response to message {message_id}")]
    SendTimeout {
        /// The message that timed out.
        message_id: String,
        /// The initial timeout of the attempt.
        timeout: Duration,
    },

    /// An envelope could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Wiring a reply or broadcast subscription failed.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// The topic was closed before the message could be handled.
    #[error("topic '{0}' is closed")]
    TopicClosed(String),

    /// The topic setup callback failed.
    #[error("setup failed for topic '{topic}': {message}")]
    TopicSetupFailed {
        /// The topic being set up.
        topic: String,
        /// The setup error.
        message: String,
    },

    /// Publishing or subscribing on the transport failed.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
}

impl Error {
    pub(crate) fn coordination<E: CoordinationError>(error: E) -> Self {
        Self::Coordination(Box::new(error))
    }

    pub(crate) fn transport<E: TransportError>(error: E) -> Self {
        Self::Transport(Box::new(error))
    }

    /// Whether a send attempt that failed with this error should be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Coordination(_)
                | Self::NoReceiverAvailable(_)
                | Self::SendTimeout { .. }
                | Self::Serialization(_)
                | Self::Subscription(_)
                | Self::Transport(_)
        )
    }

    /// Whether a topic turned a message away because of its own lifecycle (queue full, closing)
    /// rather than processing it. Such rejections are answered but never cached, so a retry with
    /// the same message id is processed once the topic is ready.
    #[must_use]
    pub const fn is_transient_rejection(&self) -> bool {
        matches!(self, Self::PendingQueueFull(_) | Self::TopicClosed(_))
    }
}
