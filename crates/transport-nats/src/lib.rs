//! Implementation of the transport using core NATS subjects.
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

use async_nats::{Client, ConnectOptions, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wire_transport::subject::{validate_publish_subject, validate_subscribe_subject};
use wire_transport::{
    Capabilities, SubscriptionHandler, SubscriptionId, Transport, TransportMessage,
};

/// Options for configuring a `NatsTransport`.
#[derive(Clone, Debug)]
pub struct NatsTransportOptions {
    /// Connection name reported to the server.
    pub client_name: Option<String>,

    /// The NATS server URL (e.g. `nats://localhost:4222`).
    pub url: String,
}

/// A transport over a NATS connection.
///
/// Replies travel through per-request inbox subscriptions, so `capabilities().direct_reply` is
/// `false`.
#[derive(Clone, Debug)]
pub struct NatsTransport {
    client: Arc<OnceCell<Client>>,
    client_name: Option<String>,
    closed: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<HashMap<SubscriptionId, CancellationToken>>>,
    task_tracker: TaskTracker,
    url: String,
}

impl NatsTransport {
    /// Creates a new NATS transport. No connection is made until `connect`.
    #[must_use]
    pub fn new(NatsTransportOptions { client_name, url }: NatsTransportOptions) -> Self {
        Self {
            client: Arc::new(OnceCell::new()),
            client_name,
            closed: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            task_tracker: TaskTracker::new(),
            url,
        }
    }

    /// Creates a transport around an already connected client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self {
            client: Arc::new(OnceCell::new_with(Some(client))),
            client_name: None,
            closed: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            task_tracker: TaskTracker::new(),
            url: String::new(),
        }
    }

    /// The underlying client, once connected.
    pub fn client(&self) -> Option<Client> {
        self.client.get().cloned()
    }

    fn connected_client(&self) -> Result<&Client, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        self.client.get().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Transport for NatsTransport {
    type Error = Error;

    async fn connect(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        self.client
            .get_or_try_init(|| async {
                let mut options = ConnectOptions::new();
                if let Some(name) = &self.client_name {
                    options = options.name(name);
                }

                let client = options
                    .connect(self.url.as_str())
                    .await
                    .map_err(|e| Error::Connect(e.to_string()))?;

                info!(url = %self.url, "connected to NATS");

                Ok::<_, Error>(client)
            })
            .await?;

        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Error> {
        validate_publish_subject(subject)?;

        self.connected_client()?
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| Error::Publish(e.to_string()))
    }

    async fn subscribe<X>(&self, subject: &str, handler: X) -> Result<SubscriptionId, Error>
    where
        X: SubscriptionHandler,
    {
        validate_subscribe_subject(subject)?;

        let mut subscriber = self
            .connected_client()?
            .subscribe(subject.to_string())
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        let id = SubscriptionId::new();
        let shutdown_token = CancellationToken::new();
        self.subscriptions
            .lock()
            .await
            .insert(id, shutdown_token.clone());

        let pattern = subject.to_string();
        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => break,
                    message = subscriber.next() => match message {
                        Some(message) => {
                            handler
                                .handle(TransportMessage {
                                    subject: message.subject.to_string(),
                                    payload: message.payload,
                                    reply: message.reply.map(|reply| reply.to_string()),
                                })
                                .await;
                        }
                        None => break,
                    },
                }
            }

            if let Err(e) = subscriber.unsubscribe().await {
                warn!(subject = %pattern, error = %e, "failed to unsubscribe");
            }
        });

        debug!(subject, %id, "subscribed");

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Error> {
        let token = self
            .subscriptions
            .lock()
            .await
            .remove(&id)
            .ok_or(Error::UnknownSubscription(id))?;

        token.cancel();
        debug!(%id, "unsubscribed");

        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Error> {
        validate_publish_subject(subject)?;

        let client = self.connected_client()?;

        match tokio::time::timeout(timeout, client.request(subject.to_string(), payload)).await {
            Ok(Ok(message)) => Ok(message.payload),
            Ok(Err(e)) => match e.kind() {
                RequestErrorKind::NoResponders => Err(Error::NoResponders(subject.to_string())),
                RequestErrorKind::TimedOut => Err(Error::Timeout(timeout)),
                _ => Err(Error::Request(e.to_string())),
            },
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct_reply: false,
        }
    }

    fn new_inbox(&self) -> String {
        self.client.get().map_or_else(
            || format!("_INBOX.{}", Uuid::new_v4().simple()),
            Client::new_inbox,
        )
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for (_, token) in self.subscriptions.lock().await.drain() {
            token.cancel();
        }

        self.task_tracker.close();
        self.task_tracker.wait().await;

        if let Some(client) = self.client.get() {
            client
                .flush()
                .await
                .map_err(|e| Error::Flush(e.to_string()))?;
        }

        info!("NATS transport closed");

        Ok(())
    }
}
