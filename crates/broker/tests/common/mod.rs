#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use wire_broker::{HandlerError, Receiver, ReceiverConfig, Sender, SenderConfig};
use wire_coordination::CoordinationAdapter;
use wire_coordination_memory::MemoryCoordinationAdapter;
use wire_transport::{Capabilities, SubscriptionHandler, SubscriptionId, Transport};
use wire_transport_memory::MemoryTransport;

pub const WIRE: &str = "test";

pub type TestReceiver = Receiver<MemoryCoordinationAdapter, MemoryTransport>;
pub type TestSender = Sender<MemoryCoordinationAdapter, MemoryTransport>;

/// One coordination store and one bus shared by every sender and receiver of a test.
#[derive(Clone, Debug, Default)]
pub struct Harness {
    pub coordination: MemoryCoordinationAdapter,
    pub transport: MemoryTransport,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receiver<F, Fut>(&self, config: ReceiverConfig, handler: F) -> TestReceiver
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Receiver::new(
            config,
            self.coordination.clone(),
            self.transport.clone(),
            handler,
        )
    }

    pub async fn echo_receiver(&self, receiver_id: &str) -> TestReceiver {
        let receiver = self.receiver(receiver_config(receiver_id), echo);
        receiver.start().await.unwrap();
        receiver
    }

    pub fn sender(&self, config: SenderConfig) -> TestSender {
        Sender::new(config, self.coordination.clone(), self.transport.clone())
    }
}

pub fn receiver_config(receiver_id: &str) -> ReceiverConfig {
    ReceiverConfig {
        receiver_id: Some(receiver_id.to_string()),
        ..ReceiverConfig::new(WIRE)
    }
}

pub fn sender_config() -> SenderConfig {
    SenderConfig {
        retry_backoff: Duration::from_millis(10),
        ..SenderConfig::new(WIRE)
    }
}

pub async fn echo(topic: String, payload: Value) -> Result<Value, HandlerError> {
    Ok(json!({"echo": payload, "topic": topic}))
}

/// A handler that reports which receiver ran it and counts its invocations.
pub fn identifying(
    receiver_id: &str,
    calls: Arc<AtomicUsize>,
) -> impl Fn(String, Value) -> std::future::Ready<Result<Value, HandlerError>> + Send + Sync + 'static
{
    let receiver_id = receiver_id.to_string();
    move |_topic, _payload| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(json!({"receiver": receiver_id})))
    }
}

/// Takes one unit from `failures` if any are left.
fn take_failure(failures: &AtomicUsize) -> bool {
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Shares state with a memory adapter but fails the first `failures` lease releases.
#[derive(Clone, Debug)]
pub struct FailingReleases {
    pub inner: MemoryCoordinationAdapter,
    pub failures: Arc<AtomicUsize>,
    pub release_attempts: Arc<AtomicUsize>,
}

impl FailingReleases {
    pub fn new(inner: MemoryCoordinationAdapter, failures: usize) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicUsize::new(failures)),
            release_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl CoordinationAdapter for FailingReleases {
    type Error = wire_coordination_memory::Error;

    async fn register_receiver(&self, receiver_id: &str, ttl: Duration) -> Result<(), Self::Error> {
        self.inner.register_receiver(receiver_id, ttl).await
    }

    async fn unregister_receiver(&self, receiver_id: &str) -> Result<(), Self::Error> {
        self.inner.unregister_receiver(receiver_id).await
    }

    async fn get_active_receivers(&self) -> Result<Vec<String>, Self::Error> {
        self.inner.get_active_receivers().await
    }

    async fn claim_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        self.inner
            .claim_topic_ownership(topic, receiver_id, ttl)
            .await
    }

    async fn get_topic_owner(&self, topic: &str) -> Result<Option<String>, Self::Error> {
        self.inner.get_topic_owner(topic).await
    }

    async fn release_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
    ) -> Result<(), Self::Error> {
        self.release_attempts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(wire_coordination_memory::Error::Closed);
        }
        self.inner.release_topic_ownership(topic, receiver_id).await
    }

    async fn renew_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        self.inner
            .renew_topic_ownership(topic, receiver_id, ttl)
            .await
    }
}

/// Shares a bus with a memory transport but fails the first `failures` unsubscribes.
#[derive(Clone, Debug)]
pub struct FailingUnsubscribes {
    pub inner: MemoryTransport,
    pub failures: Arc<AtomicUsize>,
}

impl FailingUnsubscribes {
    pub fn new(inner: MemoryTransport, failures: usize) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicUsize::new(failures)),
        }
    }
}

#[async_trait]
impl Transport for FailingUnsubscribes {
    type Error = wire_transport_memory::Error;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.inner.connect().await
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Self::Error> {
        self.inner.publish(subject, payload).await
    }

    async fn subscribe<X>(&self, subject: &str, handler: X) -> Result<SubscriptionId, Self::Error>
    where
        X: SubscriptionHandler,
    {
        self.inner.subscribe(subject, handler).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Self::Error> {
        if take_failure(&self.failures) {
            return Err(wire_transport_memory::Error::Closed);
        }
        self.inner.unsubscribe(id).await
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Self::Error> {
        self.inner.request(subject, payload, timeout).await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn new_inbox(&self) -> String {
        self.inner.new_inbox()
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.inner.close().await
    }
}
