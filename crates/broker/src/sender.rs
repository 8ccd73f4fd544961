use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wire_coordination::{CoordinationAdapter, now_millis};
use wire_transport::{SubscriptionId, Transport, TransportMessage};

use crate::retry::{RetryManager, RetryPolicy};
use crate::subject::{broadcast_subject, receiver_subject, validate_topic};
use crate::teardown::TeardownQueue;
use crate::{Error, Reply, RequestEnvelope, Response, SenderConfig, TopicResponseBroadcast};

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn acquire(counter: &'a AtomicUsize, max: usize) -> Result<Self, Error> {
        if counter.fetch_add(1, Ordering::SeqCst) >= max {
            counter.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::MaxInFlightExceeded(max));
        }

        Ok(Self(counter))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct SenderInner<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    closed: AtomicBool,
    config: SenderConfig,
    coordination: C,
    in_flight: AtomicUsize,
    retry: RetryManager,
    teardown: TeardownQueue,
    // subscription -> topic
    topic_subscriptions: Mutex<HashMap<SubscriptionId, String>>,
    transport: T,
}

/// Sends messages to whichever receiver owns their topic.
///
/// Owners are looked up (or claimed for a random live receiver) in the coordination store. Every
/// retry of one send reuses its message id, so a receiver that already processed it replies from
/// its cache.
#[derive(Clone)]
pub struct Sender<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    inner: Arc<SenderInner<C, T>>,
}

impl<C, T> Debug for Sender<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Sender")
            .field("wire_id", &self.inner.config.wire_id)
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

impl<C, T> Sender<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    /// Creates a new sender.
    pub fn new(config: SenderConfig, coordination: C, transport: T) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                closed: AtomicBool::new(false),
                coordination,
                in_flight: AtomicUsize::new(0),
                retry: RetryManager::new(RetryPolicy::from(&config)),
                teardown: TeardownQueue::new(
                    config.teardown_retry_interval,
                    config.teardown_max_attempts,
                ),
                topic_subscriptions: Mutex::new(HashMap::new()),
                transport,
                config,
            }),
        }
    }

    /// Connects the underlying transport.
    ///
    /// # Errors
    /// Returns the transport's connection error.
    pub async fn connect(&self) -> Result<(), Error> {
        self.inner
            .transport
            .connect()
            .await
            .map_err(Error::transport)
    }

    /// Sends `payload` to `topic` and waits for the response, using the default timeout if
    /// `timeout` is `None`.
    ///
    /// Handler failures are returned as `Ok(Response { success: false, .. })`.
    ///
    /// # Errors
    /// Fails immediately with `MaxInFlightExceeded` or `InvalidTopic`; otherwise fails with
    /// `RetriesExhausted` once every attempt failed.
    pub async fn send(
        &self,
        topic: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        self.send_with_message_id(Uuid::new_v4().to_string(), topic, payload, timeout)
            .await
    }

    /// Like [`send`](Self::send), with a caller-chosen message id.
    ///
    /// # Errors
    /// See [`send`](Self::send).
    pub async fn send_with_message_id(
        &self,
        message_id: impl Into<String> + Send,
        topic: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        validate_topic(topic)?;
        let _guard =
            InFlightGuard::acquire(&self.inner.in_flight, self.inner.config.max_in_flight_messages)?;

        let message_id = message_id.into();
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        let context = format!("send to topic '{topic}'");

        self.inner
            .retry
            .with_retry(&context, |attempt| {
                self.attempt(topic, &message_id, &payload, timeout, attempt)
            })
            .await
    }

    async fn attempt(
        &self,
        topic: &str,
        message_id: &str,
        payload: &Value,
        timeout: Duration,
        retry_count: u32,
    ) -> Result<Response, Error> {
        let owner = self.resolve_owner(topic).await?;

        let reply_subject = self.inner.transport.new_inbox();
        let (replies_tx, mut replies) = mpsc::unbounded_channel();
        let subscription = self
            .inner
            .transport
            .subscribe(&reply_subject, move |message: TransportMessage| {
                let _ = replies_tx.send(message.payload);
                std::future::ready(())
            })
            .await
            .map_err(|e| Error::Subscription(e.to_string()))?;

        let envelope = RequestEnvelope {
            message_id: message_id.to_string(),
            topic: topic.to_string(),
            payload: payload.clone(),
            reply_subject,
            timeout: duration_millis(timeout),
            sent_at: now_millis(),
            retry_count,
        };

        debug!(message_id, topic, %owner, retry_count, "sending message");

        let result = self
            .publish_and_wait(&owner, &envelope, &mut replies, timeout)
            .await;

        self.unsubscribe_or_queue(subscription).await;

        result
    }

    async fn publish_and_wait(
        &self,
        owner: &str,
        envelope: &RequestEnvelope,
        replies: &mut mpsc::UnboundedReceiver<Bytes>,
        timeout: Duration,
    ) -> Result<Response, Error> {
        let subject = receiver_subject(&self.inner.config.wire_id, owner, &envelope.topic);
        self.inner
            .transport
            .publish(&subject, Bytes::try_from(envelope)?)
            .await
            .map_err(Error::transport)?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => {
                    return Err(Error::SendTimeout {
                        message_id: envelope.message_id.clone(),
                        timeout,
                    });
                }
                payload = replies.recv() => {
                    let Some(payload) = payload else {
                        return Err(Error::Subscription("reply subscription closed".to_string()));
                    };

                    match Reply::try_from(payload)? {
                        Reply::Response(response) if response.message_id == envelope.message_id => {
                            return Ok(response);
                        }
                        Reply::Extension(extension) if extension.message_id == envelope.message_id => {
                            debug!(
                                message_id = %envelope.message_id,
                                extension_ms = extension.extension_ms,
                                "timeout extended"
                            );
                            deadline
                                .as_mut()
                                .reset(Instant::now() + Duration::from_millis(extension.extension_ms));
                        }
                        Reply::Response(_) | Reply::Extension(_) => {
                            debug!(message_id = %envelope.message_id, "ignoring reply for another message");
                        }
                    }
                }
            }
        }
    }

    async fn resolve_owner(&self, topic: &str) -> Result<String, Error> {
        let coordination = &self.inner.coordination;

        if let Some(owner) = coordination
            .get_topic_owner(topic)
            .await
            .map_err(Error::coordination)?
        {
            return Ok(owner);
        }

        let receivers = coordination
            .get_active_receivers()
            .await
            .map_err(Error::coordination)?;
        if receivers.is_empty() {
            return Err(Error::NoReceiverAvailable(topic.to_string()));
        }

        let candidate = &receivers[fastrand::usize(..receivers.len())];
        if coordination
            .claim_topic_ownership(topic, candidate, self.inner.config.ownership_claim_ttl)
            .await
            .map_err(Error::coordination)?
        {
            debug!(topic, receiver_id = %candidate, "claimed topic for receiver");
            return Ok(candidate.clone());
        }

        // Lost the race; the winner is the owner.
        coordination
            .get_topic_owner(topic)
            .await
            .map_err(Error::coordination)?
            .ok_or_else(|| Error::NoReceiverAvailable(topic.to_string()))
    }

    async fn unsubscribe_or_queue(&self, subscription: SubscriptionId) {
        if let Err(e) = self.inner.transport.unsubscribe(subscription).await {
            warn!(%subscription, error = %e, "failed to unsubscribe, will retry");
            self.queue_unsubscribe(subscription);
        }
    }

    fn queue_unsubscribe(&self, subscription: SubscriptionId) {
        let transport = self.inner.transport.clone();
        self.inner
            .teardown
            .push(format!("unsubscribe {subscription}"), move || {
                let transport = transport.clone();
                async move {
                    transport
                        .unsubscribe(subscription)
                        .await
                        .map_err(Error::transport)
                }
            });
    }

    /// Calls `listener` for every response broadcast on `topic`, whoever sent the request.
    ///
    /// # Errors
    /// Returns `InvalidTopic` or a `Subscription` error if the transport subscription fails.
    pub async fn subscribe_topic<F, Fut>(
        &self,
        topic: &str,
        listener: F,
    ) -> Result<SubscriptionId, Error>
    where
        F: Fn(TopicResponseBroadcast) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        validate_topic(topic)?;

        let listener = Arc::new(listener);
        let subscription = self
            .inner
            .transport
            .subscribe(
                &broadcast_subject(&self.inner.config.wire_id, topic),
                move |message: TransportMessage| {
                    let listener = listener.clone();
                    async move {
                        match TopicResponseBroadcast::try_from(message.payload) {
                            Ok(broadcast) => listener(broadcast).await,
                            Err(e) => {
                                warn!(subject = %message.subject, error = %e, "ignoring malformed broadcast");
                            }
                        }
                    }
                },
            )
            .await
            .map_err(|e| Error::Subscription(e.to_string()))?;

        self.inner
            .topic_subscriptions
            .lock()
            .insert(subscription, topic.to_string());
        info!(topic, %subscription, "subscribed to topic responses");

        Ok(subscription)
    }

    /// Removes a topic subscription. A failed unsubscribe is retried in the background.
    ///
    /// # Errors
    /// Returns a `Subscription` error if the subscription is unknown.
    pub async fn unsubscribe_topic(&self, subscription: SubscriptionId) -> Result<(), Error> {
        let topic = self
            .inner
            .topic_subscriptions
            .lock()
            .remove(&subscription)
            .ok_or_else(|| Error::Subscription(format!("unknown subscription {subscription}")))?;

        self.unsubscribe_or_queue(subscription).await;
        debug!(%topic, %subscription, "unsubscribed from topic responses");

        Ok(())
    }

    /// Tears down every topic subscription and flushes pending teardowns. Later sends fail with
    /// `NotRunning`.
    ///
    /// # Errors
    /// Never fails at present; teardown failures are logged.
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let subscriptions: Vec<SubscriptionId> = self
            .inner
            .topic_subscriptions
            .lock()
            .drain()
            .map(|(subscription, _)| subscription)
            .collect();

        for subscription in subscriptions {
            self.unsubscribe_or_queue(subscription).await;
        }

        self.inner.teardown.shutdown().await;
        info!(wire_id = %self.inner.config.wire_id, "sender closed");

        Ok(())
    }

    /// Number of sends currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Number of active topic subscriptions.
    pub fn topic_subscription_count(&self) -> usize {
        self.inner.topic_subscriptions.lock().len()
    }

    /// Number of failed unsubscribes waiting for a retry.
    pub fn pending_teardown_count(&self) -> usize {
        self.inner.teardown.len()
    }

    /// The sender's configuration.
    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }
}
