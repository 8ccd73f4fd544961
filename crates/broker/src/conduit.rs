use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use wire_coordination::CoordinationAdapter;
use wire_transport::Transport;

use crate::{ConduitConfig, Error, HandlerError, MessageHandler, Receiver, ReceiverConfig};

/// Sets up the resources for a topic the first time a message arrives for it.
///
/// The setup must call [`TopicContext::on_message`] exactly once; until it does, messages for
/// the topic are queued.
#[async_trait]
pub trait TopicSetup
where
    Self: Send + Sync + 'static,
{
    /// Sets up the topic.
    async fn setup(&self, context: TopicContext) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> TopicSetup for F
where
    F: Fn(TopicContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn setup(&self, context: TopicContext) -> Result<(), HandlerError> {
        (self)(context).await
    }
}

type CloseHandler = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type HandlerResult = Result<Value, HandlerError>;

struct PendingMessage {
    payload: Value,
    responder: oneshot::Sender<HandlerResult>,
}

enum TopicPhase {
    Pending(VecDeque<PendingMessage>),
    // Handler registered, queue still being worked through in order.
    Draining(Arc<dyn MessageHandler>, VecDeque<PendingMessage>),
    Ready(Arc<dyn MessageHandler>),
    Closed,
}

struct TopicState {
    close_handlers: Vec<CloseHandler>,
    generation: u64,
    phase: TopicPhase,
    ttl_expires_at: Option<Instant>,
}

#[derive(Clone, Copy, Debug)]
enum Rejection {
    Closed,
    NoHandler,
}

enum Dispatch {
    Run(Arc<dyn MessageHandler>, Value),
    Setup(u64, oneshot::Receiver<HandlerResult>),
    Wait(oneshot::Receiver<HandlerResult>),
}

struct TopicRegistry {
    max_pending: usize,
    next_generation: AtomicU64,
    releases: mpsc::UnboundedSender<String>,
    setup: Arc<dyn TopicSetup>,
    topics: Mutex<HashMap<String, TopicState>>,
}

impl Debug for TopicRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.topics.lock().len())
            .finish_non_exhaustive()
    }
}

impl TopicRegistry {
    async fn dispatch(self: &Arc<Self>, topic: String, payload: Value) -> HandlerResult {
        let action = {
            let mut topics = self.topics.lock();

            match topics.get_mut(&topic) {
                Some(state) => match &mut state.phase {
                    TopicPhase::Ready(handler) => Dispatch::Run(handler.clone(), payload),
                    TopicPhase::Pending(queue) | TopicPhase::Draining(_, queue) => {
                        if queue.len() >= self.max_pending {
                            return Err(Error::PendingQueueFull(topic).into());
                        }
                        let (responder, response) = oneshot::channel();
                        queue.push_back(PendingMessage { payload, responder });
                        Dispatch::Wait(response)
                    }
                    TopicPhase::Closed => return Err(Error::TopicClosed(topic).into()),
                },
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (responder, response) = oneshot::channel();
                    topics.insert(
                        topic.clone(),
                        TopicState {
                            close_handlers: Vec::new(),
                            generation,
                            phase: TopicPhase::Pending(VecDeque::from([PendingMessage {
                                payload,
                                responder,
                            }])),
                            ttl_expires_at: None,
                        },
                    );
                    Dispatch::Setup(generation, response)
                }
            }
        };

        let response = match action {
            Dispatch::Run(handler, payload) => return handler.handle(topic, payload).await,
            Dispatch::Setup(generation, response) => {
                debug!(%topic, generation, "setting up topic");
                tokio::spawn(Self::run_setup(self.clone(), topic.clone(), generation));
                response
            }
            Dispatch::Wait(response) => response,
        };

        response
            .await
            .unwrap_or_else(|_| Err(Error::TopicClosed(topic).into()))
    }

    async fn run_setup(self: Arc<Self>, topic: String, generation: u64) {
        let context = TopicContext {
            generation,
            registry: self.clone(),
            topic: topic.clone(),
        };

        let result = self.setup.setup(context).await;

        let rejection = {
            let topics = self.topics.lock();
            let Some(state) = topics.get(&topic).filter(|s| s.generation == generation) else {
                return;
            };

            match (&state.phase, &result) {
                (TopicPhase::Closed, _)
                | (TopicPhase::Ready(_) | TopicPhase::Draining(..), Ok(())) => return,
                (_, Err(e)) => {
                    warn!(%topic, error = %e, "topic setup failed");
                    Err(e.to_string())
                }
                (TopicPhase::Pending(_), Ok(())) => {
                    warn!(%topic, "topic setup registered no message handler");
                    Ok(Rejection::NoHandler)
                }
            }
        };

        match rejection {
            Ok(rejection) => {
                self.close_topic(&topic, Some(generation), rejection, false)
                    .await;
            }
            Err(message) => {
                self.close_topic_with(&topic, Some(generation), false, |topic| {
                    Error::TopicSetupFailed {
                        topic: topic.to_string(),
                        message: message.clone(),
                    }
                })
                .await;
            }
        }
    }

    /// Works through the queue of a `Draining` topic in arrival order, including messages that
    /// arrive meanwhile, then switches the topic to `Ready`.
    async fn drain(
        self: Arc<Self>,
        topic: String,
        generation: u64,
        handler: Arc<dyn MessageHandler>,
    ) {
        loop {
            let message = {
                let mut topics = self.topics.lock();
                let Some(state) = topics
                    .get_mut(&topic)
                    .filter(|state| state.generation == generation)
                else {
                    return;
                };

                let next = match &mut state.phase {
                    TopicPhase::Draining(_, queue) => queue.pop_front(),
                    _ => return,
                };

                match next {
                    Some(message) => message,
                    None => {
                        state.phase = TopicPhase::Ready(handler);
                        debug!(%topic, "topic ready");
                        return;
                    }
                }
            };

            let result = handler.handle(topic.clone(), message.payload).await;
            let _ = message.responder.send(result);
        }
    }

    async fn close_topic(
        &self,
        topic: &str,
        generation: Option<u64>,
        rejection: Rejection,
        release: bool,
    ) -> bool {
        self.close_topic_with(topic, generation, release, |topic| match rejection {
            Rejection::Closed => Error::TopicClosed(topic.to_string()),
            Rejection::NoHandler => Error::NoMessageHandler(topic.to_string()),
        })
        .await
    }

    /// Moves the topic to `Closed`, rejects queued messages, runs close handlers in registration
    /// order, then forgets the topic.
    async fn close_topic_with<R>(
        &self,
        topic: &str,
        generation: Option<u64>,
        release: bool,
        reject: R,
    ) -> bool
    where
        R: Fn(&str) -> Error,
    {
        let (pending, close_handlers, generation) = {
            let mut topics = self.topics.lock();
            let Some(state) = topics.get_mut(topic) else {
                return false;
            };
            if generation.is_some_and(|g| g != state.generation)
                || matches!(state.phase, TopicPhase::Closed)
            {
                return false;
            }

            let pending = match std::mem::replace(&mut state.phase, TopicPhase::Closed) {
                TopicPhase::Pending(queue) | TopicPhase::Draining(_, queue) => queue,
                TopicPhase::Ready(_) | TopicPhase::Closed => VecDeque::new(),
            };

            (
                pending,
                std::mem::take(&mut state.close_handlers),
                state.generation,
            )
        };

        for message in pending {
            let _ = message.responder.send(Err(reject(topic).into()));
        }

        for handler in close_handlers {
            handler().await;
        }

        {
            let mut topics = self.topics.lock();
            if topics
                .get(topic)
                .is_some_and(|state| state.generation == generation)
            {
                topics.remove(topic);
            }
        }

        if release && self.releases.send(topic.to_string()).is_err() {
            debug!(topic, "conduit stopped, lease left to expire");
        }

        info!(topic, release, "topic closed");

        true
    }

    async fn close_all(&self) {
        let topics: Vec<String> = self.topics.lock().keys().cloned().collect();

        for topic in topics {
            self.close_topic(&topic, None, Rejection::Closed, false)
                .await;
        }
    }

    fn expired(&self, now: Instant) -> Vec<(String, u64)> {
        self.topics
            .lock()
            .iter()
            .filter(|(_, state)| {
                !matches!(state.phase, TopicPhase::Closed)
                    && state.ttl_expires_at.is_some_and(|at| at <= now)
            })
            .map(|(topic, state)| (topic.clone(), state.generation))
            .collect()
    }

    fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .lock()
            .iter()
            .filter(|(_, state)| !matches!(state.phase, TopicPhase::Closed))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    fn with_live_state<R>(
        &self,
        topic: &str,
        generation: u64,
        f: impl FnOnce(&mut TopicState) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut topics = self.topics.lock();

        match topics.get_mut(topic) {
            Some(state)
                if state.generation == generation
                    && !matches!(state.phase, TopicPhase::Closed) =>
            {
                f(state)
            }
            _ => Err(Error::TopicClosed(topic.to_string())),
        }
    }
}

/// Handle given to [`TopicSetup`] for one incarnation of a topic.
#[derive(Clone, Debug)]
pub struct TopicContext {
    generation: u64,
    registry: Arc<TopicRegistry>,
    topic: String,
}

impl TopicContext {
    /// The topic being set up.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Keeps the topic open for at least `ttl` from now. Once the TTL elapses the topic is closed
    /// and its lease released.
    ///
    /// # Errors
    /// Returns `TopicClosed` if the topic was already closed.
    pub fn extend_ttl(&self, ttl: Duration) -> Result<(), Error> {
        self.registry
            .with_live_state(&self.topic, self.generation, |state| {
                state.ttl_expires_at = Some(Instant::now() + ttl);
                Ok(())
            })
    }

    /// Registers the topic's message handler and resolves queued messages in arrival order.
    ///
    /// # Errors
    /// Returns `HandlerAlreadyRegistered` on a second call, or `TopicClosed`.
    pub fn on_message<H>(&self, handler: H) -> Result<(), Error>
    where
        H: MessageHandler,
    {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);

        let queued = self
            .registry
            .with_live_state(&self.topic, self.generation, |state| {
                let queue = match &mut state.phase {
                    TopicPhase::Pending(queue) => std::mem::take(queue),
                    TopicPhase::Draining(..) | TopicPhase::Ready(_) => {
                        return Err(Error::HandlerAlreadyRegistered(self.topic.clone()));
                    }
                    TopicPhase::Closed => return Err(Error::TopicClosed(self.topic.clone())),
                };
                let queued = queue.len();
                state.phase = if queue.is_empty() {
                    TopicPhase::Ready(handler.clone())
                } else {
                    TopicPhase::Draining(handler.clone(), queue)
                };
                Ok(queued)
            })?;

        debug!(topic = %self.topic, queued, "message handler registered");

        if queued > 0 {
            tokio::spawn(self.registry.clone().drain(
                self.topic.clone(),
                self.generation,
                handler,
            ));
        }

        Ok(())
    }

    /// Registers a cleanup callback. Callbacks run in registration order when the topic closes.
    ///
    /// # Errors
    /// Returns `TopicClosed` if the topic was already closed.
    pub fn on_close<F, Fut>(&self, handler: F) -> Result<(), Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry
            .with_live_state(&self.topic, self.generation, |state| {
                state
                    .close_handlers
                    .push(Box::new(move || -> BoxFuture<'static, ()> {
                        Box::pin(handler())
                    }));
                Ok(())
            })
    }

    /// Closes the topic now, running its close handlers and releasing its lease.
    pub async fn close(&self) {
        self.registry
            .close_topic(&self.topic, Some(self.generation), Rejection::Closed, true)
            .await;
    }
}

struct ConduitDispatch {
    registry: Arc<TopicRegistry>,
}

#[async_trait]
impl MessageHandler for ConduitDispatch {
    async fn handle(&self, topic: String, payload: Value) -> HandlerResult {
        self.registry.dispatch(topic, payload).await
    }
}

struct Background {
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// A [`Receiver`] whose topics each get a setup step, optional close handlers and a voluntary
/// TTL.
pub struct ConduitReceiver<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    background: Mutex<Option<Background>>,
    config: ConduitConfig,
    receiver: Receiver<C, T>,
    registry: Arc<TopicRegistry>,
    releases: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl<C, T> Debug for ConduitReceiver<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ConduitReceiver")
            .field("receiver", &self.receiver)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<C, T> ConduitReceiver<C, T>
where
    C: CoordinationAdapter,
    T: Transport,
{
    /// Creates a stopped conduit receiver.
    pub fn new<S>(
        receiver_config: ReceiverConfig,
        config: ConduitConfig,
        coordination: C,
        transport: T,
        setup: S,
    ) -> Self
    where
        S: TopicSetup,
    {
        let (releases_tx, releases_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(TopicRegistry {
            max_pending: config.max_pending_messages,
            next_generation: AtomicU64::new(0),
            releases: releases_tx,
            setup: Arc::new(setup),
            topics: Mutex::new(HashMap::new()),
        });

        let receiver = Receiver::new(
            receiver_config,
            coordination,
            transport,
            ConduitDispatch {
                registry: registry.clone(),
            },
        );

        Self {
            background: Mutex::new(None),
            config,
            receiver,
            registry,
            releases: Arc::new(tokio::sync::Mutex::new(releases_rx)),
        }
    }

    /// Starts the receiver and the TTL, ownership-loss and release loops.
    ///
    /// # Errors
    /// See [`Receiver::start`].
    pub async fn start(&self) -> Result<(), Error> {
        self.receiver.start().await?;

        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        task_tracker.spawn(Self::ttl_loop(
            self.registry.clone(),
            self.config.ttl_check_interval,
            shutdown_token.clone(),
        ));
        task_tracker.spawn(Self::loss_loop(
            self.registry.clone(),
            self.receiver.ownership_losses(),
            shutdown_token.clone(),
        ));
        task_tracker.spawn(Self::release_loop(
            self.receiver.clone(),
            self.releases.clone(),
            shutdown_token.clone(),
        ));
        task_tracker.close();

        *self.background.lock() = Some(Background {
            shutdown_token,
            task_tracker,
        });

        Ok(())
    }

    /// Closes every topic (running close handlers) and stops the receiver.
    ///
    /// # Errors
    /// See [`Receiver::stop`].
    pub async fn stop(&self) -> Result<(), Error> {
        let background = self.background.lock().take();
        if let Some(Background {
            shutdown_token,
            task_tracker,
        }) = background
        {
            shutdown_token.cancel();
            task_tracker.wait().await;
        }

        // The receiver releases every lease it still holds.
        self.registry.close_all().await;
        self.receiver.stop().await
    }

    /// Voluntarily closes `topic` and releases its lease. Returns `false` if it was not open.
    pub async fn close_topic(&self, topic: &str) -> bool {
        self.registry
            .close_topic(topic, None, Rejection::Closed, true)
            .await
    }

    /// Topics with live state in this process, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        self.registry.active_topics()
    }

    /// The underlying receiver.
    pub const fn receiver(&self) -> &Receiver<C, T> {
        &self.receiver
    }

    async fn ttl_loop(
        registry: Arc<TopicRegistry>,
        interval: Duration,
        shutdown_token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => break,
                _ = ticker.tick() => {
                    for (topic, generation) in registry.expired(Instant::now()) {
                        debug!(%topic, "topic ttl elapsed");
                        registry
                            .close_topic(&topic, Some(generation), Rejection::Closed, true)
                            .await;
                    }
                }
            }
        }
    }

    async fn loss_loop(
        registry: Arc<TopicRegistry>,
        mut losses: broadcast::Receiver<String>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => break,
                lost = losses.recv() => match lost {
                    Ok(topic) => {
                        if registry.close_topic(&topic, None, Rejection::Closed, false).await {
                            info!(%topic, "closed topic after losing ownership");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed ownership-loss notifications");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn release_loop(
        receiver: Receiver<C, T>,
        releases: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
        shutdown_token: CancellationToken,
    ) {
        let mut releases = releases.lock().await;

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => break,
                topic = releases.recv() => match topic {
                    Some(topic) => receiver.release_topic(&topic).await,
                    None => break,
                },
            }
        }
    }
}
