use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wire_coordination::{CoordinationAdapter, now_millis};
use wire_transport::{SubscriptionId, Transport, TransportMessage};

use crate::cache::MessageCache;
use crate::deadline::{DeadlineMonitor, DueExtension};
use crate::ownership::OwnershipManager;
use crate::subject::{broadcast_subject, receiver_wildcard};
use crate::teardown::TeardownQueue;
use crate::{
    Error, MessageHandler, ReceiverConfig, RequestEnvelope, Response, TimeoutExtension,
    TopicResponseBroadcast,
};

/// Lifecycle state of a [`Receiver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    /// Not registered or subscribed.
    Stopped,

    /// `start` is in progress.
    Starting,

    /// Registered, subscribed and processing messages.
    Running,

    /// `stop` is in progress.
    Stopping,
}

struct Running {
    shutdown_token: CancellationToken,
    subscription: SubscriptionId,
    task_tracker: TaskTracker,
}

struct ReceiverInner<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    cache: MessageCache,
    config: ReceiverConfig,
    coordination: C,
    deadlines: DeadlineMonitor,
    handler: Arc<dyn MessageHandler>,
    // message id -> reply subjects waiting on it
    in_flight: Mutex<HashMap<String, Vec<String>>>,
    ownership: OwnershipManager<C>,
    receiver_id: String,
    running: tokio::sync::Mutex<Option<Running>>,
    state: Mutex<ReceiverState>,
    teardown: TeardownQueue,
    transport: T,
}

/// Processes messages for the topics this process owns.
///
/// A receiver registers itself in the coordination store, consumes every message routed to it,
/// answers retries of already processed messages from its cache, keeps slow requests alive with
/// timeout extensions, and broadcasts each response to the topic's listeners.
#[derive(Clone)]
pub struct Receiver<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    inner: Arc<ReceiverInner<C, T>>,
}

impl<C, T> Debug for Receiver<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Receiver")
            .field("receiver_id", &self.inner.receiver_id)
            .field("wire_id", &self.inner.config.wire_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C, T> Receiver<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    /// Creates a stopped receiver.
    pub fn new<H>(config: ReceiverConfig, coordination: C, transport: T, handler: H) -> Self
    where
        H: MessageHandler,
    {
        let receiver_id = config
            .receiver_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            inner: Arc::new(ReceiverInner {
                cache: MessageCache::new(config.message_cache_size, config.message_cache_ttl),
                deadlines: DeadlineMonitor::new(
                    config.timeout_extension_threshold,
                    config.timeout_extension,
                ),
                handler: Arc::new(handler),
                in_flight: Mutex::new(HashMap::new()),
                ownership: OwnershipManager::new(
                    coordination.clone(),
                    receiver_id.clone(),
                    config.topic_ownership_ttl,
                    config.ownership_renewal_interval,
                ),
                receiver_id,
                running: tokio::sync::Mutex::new(None),
                state: Mutex::new(ReceiverState::Stopped),
                teardown: TeardownQueue::new(
                    config.teardown_retry_interval,
                    config.teardown_max_attempts,
                ),
                config,
                coordination,
                transport,
            }),
        }
    }

    /// Registers the receiver, subscribes to its subject and starts the background loops.
    ///
    /// # Errors
    /// Returns `Error::AlreadyRunning` unless stopped, or the registration/subscription error.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            if *state != ReceiverState::Stopped {
                return Err(Error::AlreadyRunning);
            }
            *state = ReceiverState::Starting;
        }

        match self.start_services().await {
            Ok(running) => {
                *self.inner.running.lock().await = Some(running);
                *self.inner.state.lock() = ReceiverState::Running;
                info!(
                    receiver_id = %self.inner.receiver_id,
                    wire_id = %self.inner.config.wire_id,
                    "receiver started"
                );
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = ReceiverState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_services(&self) -> Result<Running, Error> {
        let inner = &self.inner;

        inner.transport.connect().await.map_err(Error::transport)?;
        inner
            .coordination
            .register_receiver(&inner.receiver_id, inner.config.heartbeat_ttl)
            .await
            .map_err(Error::coordination)?;

        let weak = Arc::downgrade(&self.inner);
        let subscription = match inner
            .transport
            .subscribe(
                &receiver_wildcard(&inner.config.wire_id, &inner.receiver_id),
                move |message: TransportMessage| {
                    Self::dispatch(&weak, message);
                    std::future::ready(())
                },
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(e) = inner
                    .coordination
                    .unregister_receiver(&inner.receiver_id)
                    .await
                {
                    warn!(error = %e, "failed to unregister after failed start");
                }
                return Err(Error::transport(e));
            }
        };

        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        task_tracker.spawn(self.clone().heartbeat_loop(shutdown_token.clone()));
        task_tracker.spawn(self.clone().extension_loop(shutdown_token.clone()));
        task_tracker.close();

        inner.ownership.start();
        inner
            .cache
            .start_sweeper(inner.config.message_cache_sweep_interval);

        Ok(Running {
            shutdown_token,
            subscription,
            task_tracker,
        })
    }

    /// Stops the background loops, unsubscribes, releases every owned topic and unregisters.
    ///
    /// Messages already being processed finish in the background; their replies are still
    /// published if the transport is open. Releases and unsubscribes that fail are retried in the
    /// background after `stop` returns.
    ///
    /// # Errors
    /// Returns `Error::NotRunning` unless running.
    pub async fn stop(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            if *state != ReceiverState::Running {
                return Err(Error::NotRunning);
            }
            *state = ReceiverState::Stopping;
        }

        let running = self.inner.running.lock().await.take();
        if let Some(Running {
            shutdown_token,
            subscription,
            task_tracker,
        }) = running
        {
            shutdown_token.cancel();
            task_tracker.wait().await;
            self.inner.ownership.stop();

            // No new message may re-add a topic once the owned set is drained.
            if let Err(e) = self.inner.transport.unsubscribe(subscription).await {
                warn!(error = %e, "failed to unsubscribe receiver, will retry");
                self.queue_unsubscribe(subscription);
            }

            for topic in self.inner.ownership.release_all().await {
                self.queue_release(topic);
            }

            if let Err(e) = self
                .inner
                .coordination
                .unregister_receiver(&self.inner.receiver_id)
                .await
            {
                warn!(error = %e, "failed to unregister receiver");
            }
        }

        self.inner.cache.stop_sweeper();

        *self.inner.state.lock() = ReceiverState::Stopped;
        info!(
            receiver_id = %self.inner.receiver_id,
            pending_teardown = self.inner.teardown.len(),
            "receiver stopped"
        );

        Ok(())
    }

    /// Gives up ownership of `topic`. A failed release is retried in the background.
    pub async fn release_topic(&self, topic: &str) {
        if let Err(e) = self.inner.ownership.release(topic).await {
            warn!(topic, error = %e, "failed to release topic, will retry");
            self.queue_release(topic.to_string());
        } else {
            debug!(topic, "released topic");
        }
    }

    /// Number of failed releases and unsubscribes waiting to be retried.
    pub fn pending_teardown_count(&self) -> usize {
        self.inner.teardown.len()
    }

    fn queue_release(&self, topic: String) {
        let coordination = self.inner.coordination.clone();
        let receiver_id = self.inner.receiver_id.clone();
        self.inner
            .teardown
            .push(format!("release topic '{topic}'"), move || {
                let coordination = coordination.clone();
                let receiver_id = receiver_id.clone();
                let topic = topic.clone();
                async move {
                    coordination
                        .release_topic_ownership(&topic, &receiver_id)
                        .await
                        .map_err(Error::coordination)
                }
            });
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

    /// This receiver's id.
    pub fn receiver_id(&self) -> &str {
        &self.inner.receiver_id
    }

    /// The receiver's configuration.
    pub fn config(&self) -> &ReceiverConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReceiverState {
        *self.inner.state.lock()
    }

    /// Topics this receiver believes it owns, sorted.
    pub fn owned_topics(&self) -> Vec<String> {
        self.inner.ownership.owned_topics()
    }

    /// Number of topics this receiver believes it owns.
    pub fn owned_topic_count(&self) -> usize {
        self.inner.ownership.owned_topic_count()
    }

    /// Whether this receiver believes it owns `topic`.
    pub fn owns_topic(&self, topic: &str) -> bool {
        self.inner.ownership.owns_topic(topic)
    }

    /// Notifications of topics whose lease was lost.
    pub fn ownership_losses(&self) -> broadcast::Receiver<String> {
        self.inner.ownership.subscribe_losses()
    }

    /// The ownership tracker (renewals can be driven directly, e.g. in tests).
    pub fn ownership(&self) -> &OwnershipManager<C> {
        &self.inner.ownership
    }

    /// Number of messages currently being processed.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    fn dispatch(weak: &Weak<ReceiverInner<C, T>>, message: TransportMessage) {
        if let Some(inner) = weak.upgrade() {
            tokio::spawn(Self { inner }.process(message));
        }
    }

    async fn process(self, message: TransportMessage) {
        let envelope = match RequestEnvelope::try_from(message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(subject = %message.subject, error = %e, "dropping undecodable message");
                return;
            }
        };

        let RequestEnvelope {
            message_id,
            topic,
            payload,
            reply_subject,
            timeout,
            sent_at,
            retry_count,
        } = envelope;

        if let Some(response) = self.inner.cache.get(&message_id) {
            debug!(%message_id, %topic, retry_count, "replaying cached response");
            self.reply(&reply_subject, &response).await;
            return;
        }

        {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(reply_subjects) = in_flight.get_mut(&message_id) {
                reply_subjects.push(reply_subject);
                debug!(%message_id, %topic, retry_count, "joined in-flight message");
                return;
            }
            in_flight.insert(message_id.clone(), vec![reply_subject]);
        }

        if self.inner.ownership.add_topic(&topic) {
            debug!(%topic, receiver_id = %self.inner.receiver_id, "owning topic");
        }
        self.inner
            .deadlines
            .track(&message_id, sent_at, Duration::from_millis(timeout));

        let (response, settled) = match self.inner.handler.handle(topic.clone(), payload).await {
            Ok(result) => (Response::success(&message_id, result), true),
            Err(e) => {
                let transient = e
                    .downcast_ref::<Error>()
                    .is_some_and(Error::is_transient_rejection);
                debug!(%message_id, %topic, error = %e, transient, "handler failed");
                (Response::failure(&message_id, e.to_string()), !transient)
            }
        };

        self.inner.deadlines.untrack(&message_id);
        if settled {
            self.inner.cache.set(message_id.clone(), response.clone());
        }

        let reply_subjects = self
            .inner
            .in_flight
            .lock()
            .remove(&message_id)
            .unwrap_or_default();
        for reply_subject in &reply_subjects {
            self.reply(reply_subject, &response).await;
        }

        if settled {
            self.broadcast(topic, response).await;
        }
    }

    async fn reply(&self, reply_subject: &str, response: &Response) {
        let bytes = match Bytes::try_from(response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(message_id = %response.message_id, error = %e, "failed to encode response");
                return;
            }
        };

        // The sender may have given up; a retry will be answered from the cache.
        if let Err(e) = self.inner.transport.publish(reply_subject, bytes).await {
            debug!(reply_subject, error = %e, "reply not delivered");
        }
    }

    async fn broadcast(&self, topic: String, response: Response) {
        let subject = broadcast_subject(&self.inner.config.wire_id, &topic);
        let broadcast = TopicResponseBroadcast {
            message_id: response.message_id.clone(),
            topic,
            response,
            receiver_id: self.inner.receiver_id.clone(),
            broadcast_at: now_millis(),
        };

        let result = match Bytes::try_from(&broadcast) {
            Ok(bytes) => self
                .inner
                .transport
                .publish(&subject, bytes)
                .await
                .map_err(Error::transport),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(%subject, message_id = %broadcast.message_id, error = %e, "broadcast failed");
        }
    }

    async fn send_extension(&self, due: DueExtension) {
        let Some(reply_subjects) = self.inner.in_flight.lock().get(&due.message_id).cloned() else {
            return;
        };

        let extension_ms = u64::try_from(due.extension.as_millis()).unwrap_or(u64::MAX);
        let bytes = match Bytes::try_from(&TimeoutExtension::new(&due.message_id, extension_ms)) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(message_id = %due.message_id, error = %e, "failed to encode extension");
                return;
            }
        };

        debug!(message_id = %due.message_id, extension_ms, "extending timeout");

        for reply_subject in &reply_subjects {
            if let Err(e) = self
                .inner
                .transport
                .publish(reply_subject, bytes.clone())
                .await
            {
                debug!(reply_subject, error = %e, "extension not delivered");
            }
        }
    }

    async fn extension_loop(self, shutdown_token: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => break,
                due = self.inner.deadlines.next_due() => {
                    for extension in due {
                        self.send_extension(extension).await;
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(self, shutdown_token: CancellationToken) {
        let interval = self.inner.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .inner
                        .coordination
                        .register_receiver(&self.inner.receiver_id, self.inner.config.heartbeat_ttl)
                        .await
                    {
                        warn!(receiver_id = %self.inner.receiver_id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }
}
