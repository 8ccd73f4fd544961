//! In-memory (single process) implementation of the transport for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;
use wire_transport::subject::{matches, validate_publish_subject, validate_subscribe_subject};
use wire_transport::{
    Capabilities, SubscriptionHandler, SubscriptionId, Transport, TransportMessage,
};

#[derive(Debug)]
struct Route {
    pattern: String,
    sender: mpsc::UnboundedSender<TransportMessage>,
    shutdown_token: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    closed: AtomicBool,
    pending_replies: Mutex<HashMap<String, oneshot::Sender<Bytes>>>,
    routes: Mutex<HashMap<SubscriptionId, Route>>,
}

/// An in-process bus.
///
/// Construct one per process and share it (clones share state). Each subscription gets its own
/// queue and delivery task, so a slow handler only delays its own subscription. Replies to
/// `request` are handed directly to the waiting caller.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    /// Creates a new in-memory transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.routes.lock().await.len()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        Ok(())
    }

    /// Delivers a message, returning how many receivers it reached.
    async fn deliver(&self, message: TransportMessage) -> Result<usize, Error> {
        self.ensure_open()?;
        validate_publish_subject(&message.subject)?;

        let mut delivered = 0;

        let waiter = self
            .inner
            .pending_replies
            .lock()
            .await
            .remove(&message.subject);
        if let Some(waiter) = waiter {
            if waiter.send(message.payload.clone()).is_ok() {
                delivered += 1;
            }
        }

        let routes = self.inner.routes.lock().await;
        for route in routes
            .values()
            .filter(|route| matches(&route.pattern, &message.subject))
        {
            if route.sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        drop(routes);

        trace!(subject = %message.subject, delivered, "delivered message");

        Ok(delivered)
    }

    async fn process_messages<X>(
        mut receiver: mpsc::UnboundedReceiver<TransportMessage>,
        handler: X,
        shutdown_token: CancellationToken,
    ) where
        X: SubscriptionHandler,
    {
        loop {
            tokio::select! {
                biased;
                () = shutdown_token.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => handler.handle(message).await,
                    None => break,
                },
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Error = Error;

    async fn connect(&self) -> Result<(), Error> {
        self.ensure_open()
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Error> {
        self.deliver(TransportMessage {
            subject: subject.to_string(),
            payload,
            reply: None,
        })
        .await
        .map(|_| ())
    }

    async fn subscribe<X>(&self, subject: &str, handler: X) -> Result<SubscriptionId, Error>
    where
        X: SubscriptionHandler,
    {
        self.ensure_open()?;
        validate_subscribe_subject(subject)?;

        let id = SubscriptionId::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();

        tokio::spawn(Self::process_messages(
            receiver,
            handler,
            shutdown_token.clone(),
        ));

        self.inner.routes.lock().await.insert(
            id,
            Route {
                pattern: subject.to_string(),
                sender,
                shutdown_token,
            },
        );

        debug!(subject, %id, "subscribed");

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Error> {
        let route = self
            .inner
            .routes
            .lock()
            .await
            .remove(&id)
            .ok_or(Error::UnknownSubscription(id))?;

        route.shutdown_token.cancel();
        debug!(subject = %route.pattern, %id, "unsubscribed");

        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Error> {
        let inbox = self.new_inbox();
        let (waiter, response) = oneshot::channel();
        self.inner
            .pending_replies
            .lock()
            .await
            .insert(inbox.clone(), waiter);

        let delivered = self
            .deliver(TransportMessage {
                subject: subject.to_string(),
                payload,
                reply: Some(inbox.clone()),
            })
            .await;

        let result = match delivered {
            Ok(0) => Err(Error::NoResponders(subject.to_string())),
            Ok(_) => match tokio::time::timeout(timeout, response).await {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(_)) => Err(Error::Closed),
                Err(_) => Err(Error::Timeout(timeout)),
            },
            Err(e) => Err(e),
        };

        self.inner.pending_replies.lock().await.remove(&inbox);

        result
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { direct_reply: true }
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.closed.store(true, Ordering::Release);

        for (_, route) in self.inner.routes.lock().await.drain() {
            route.shutdown_token.cancel();
        }
        self.inner.pending_replies.lock().await.clear();

        debug!("memory transport closed");

        Ok(())
    }
}
