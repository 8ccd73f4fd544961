//! Abstract interface for subject-based publish/subscribe and request/reply transports.
//!
//! Subjects are dot-separated tokens (`wire.w1.receiver.r1.orders`). Subscriptions may use `*`
//! to match exactly one token and a trailing `>` to match one or more remaining tokens.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Subject validation and wildcard matching.
pub mod subject;

use std::error::Error;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

/// Marker trait for transport errors
pub trait TransportError: Debug + Error + Send + Sync + 'static {}

/// Identifies one subscription on a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generates a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(&self.0, f)
    }
}

/// A message delivered to a subscription handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportMessage {
    /// The concrete subject the message was published on.
    pub subject: String,

    /// The raw payload.
    pub payload: Bytes,

    /// Where to send a reply, if the publisher is awaiting one.
    pub reply: Option<String>,
}

/// How a transport delivers replies to [`Transport::request`].
///
/// This describes the adapter's own request/reply path only. The broker always listens for
/// replies on an inbox subscription from [`Transport::new_inbox`], which behaves the same on
/// every adapter, so it never branches on these flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Replies are handed straight to the waiting requester in-process rather than travelling
    /// through a broker-side inbox subscription.
    pub direct_reply: bool,
}

/// A trait representing a handler for messages arriving on a subscription.
#[async_trait]
pub trait SubscriptionHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles the given message.
    async fn handle(&self, message: TransportMessage);
}

#[async_trait]
impl<F, Fut> SubscriptionHandler for F
where
    F: Fn(TransportMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: TransportMessage) {
        (self)(message).await;
    }
}

/// A trait representing a subject-based message transport.
#[async_trait]
pub trait Transport
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the transport.
    type Error: TransportError;

    /// Connects to the underlying broker. Idempotent.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Publishes a payload to a concrete (non-wildcard) subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Self::Error>;

    /// Subscribes a handler to a subject (which may contain wildcards).
    ///
    /// Messages for one subscription are handed to the handler one at a time, in publish order.
    async fn subscribe<X>(&self, subject: &str, handler: X) -> Result<SubscriptionId, Self::Error>
    where
        X: SubscriptionHandler;

    /// Removes a subscription.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Self::Error>;

    /// Publishes a payload with a reply subject attached and awaits the first reply.
    ///
    /// A convenience for one-shot callers. Broker senders do not use it because they must accept
    /// several timeout extensions before the final reply.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Self::Error>;

    /// Describes how this transport delivers replies.
    fn capabilities(&self) -> Capabilities;

    /// Generates a new, globally unique inbox subject for replies.
    fn new_inbox(&self) -> String;

    /// Closes the transport, dropping every subscription.
    async fn close(&self) -> Result<(), Self::Error>;
}
