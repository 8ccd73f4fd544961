use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wire_coordination::CoordinationAdapter;

use crate::Error;

const LOSS_CHANNEL_CAPACITY: usize = 256;

/// Tracks the topics one receiver believes it owns and keeps their leases alive.
///
/// The local set is bookkeeping only; the coordination store stays the source of truth. A
/// renewal that returns `false` removes the topic and announces the loss on
/// [`subscribe_losses`](Self::subscribe_losses).
#[derive(Clone, Debug)]
pub struct OwnershipManager<C>
where
    C: CoordinationAdapter,
{
    coordination: C,
    losses: broadcast::Sender<String>,
    owned: Arc<Mutex<HashSet<String>>>,
    receiver_id: String,
    renewal_interval: Duration,
    shutdown_token: Arc<Mutex<Option<CancellationToken>>>,
    ttl: Duration,
}

impl<C> OwnershipManager<C>
where
    C: CoordinationAdapter,
{
    /// Creates a manager for `receiver_id`.
    pub fn new(
        coordination: C,
        receiver_id: impl Into<String>,
        ttl: Duration,
        renewal_interval: Duration,
    ) -> Self {
        let (losses, _) = broadcast::channel(LOSS_CHANNEL_CAPACITY);

        Self {
            coordination,
            losses,
            owned: Arc::new(Mutex::new(HashSet::new())),
            receiver_id: receiver_id.into(),
            renewal_interval,
            shutdown_token: Arc::new(Mutex::new(None)),
            ttl,
        }
    }

    /// Starts the renewal loop, replacing any running one.
    pub fn start(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.shutdown_token.lock().replace(token.clone()) {
            previous.cancel();
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + manager.renewal_interval,
                manager.renewal_interval,
            );

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.renew_all().await;
                    }
                }
            }
        });
    }

    /// Stops the renewal loop.
    pub fn stop(&self) {
        if let Some(token) = self.shutdown_token.lock().take() {
            token.cancel();
        }
    }

    /// Renews every owned topic in parallel, returning the topics that were lost.
    pub async fn renew_all(&self) -> Vec<String> {
        let topics = self.owned_topics();

        let results = join_all(topics.iter().map(|topic| {
            self.coordination
                .renew_topic_ownership(topic, &self.receiver_id, self.ttl)
        }))
        .await;

        let mut lost = Vec::new();
        for (topic, result) in topics.into_iter().zip(results) {
            match result {
                Ok(true) => {}
                Ok(false) => {
                    self.owned.lock().remove(&topic);
                    warn!(%topic, receiver_id = %self.receiver_id, "lost topic ownership");
                    let _ = self.losses.send(topic.clone());
                    lost.push(topic);
                }
                Err(e) => {
                    warn!(%topic, error = %e, "failed to renew topic ownership");
                }
            }
        }

        debug!(renewed = self.owned_topic_count(), lost = lost.len(), "renewed topics");

        lost
    }

    /// Releases every owned topic and clears local state. Returns the topics whose release
    /// failed.
    pub async fn release_all(&self) -> Vec<String> {
        let topics: Vec<String> = self.owned.lock().drain().collect();

        let results = join_all(topics.iter().map(|topic| {
            self.coordination
                .release_topic_ownership(topic, &self.receiver_id)
        }))
        .await;

        let mut failed = Vec::new();
        for (topic, result) in topics.into_iter().zip(results) {
            if let Err(e) = result {
                warn!(%topic, error = %e, "failed to release topic ownership");
                failed.push(topic);
            }
        }

        info!(receiver_id = %self.receiver_id, failed = failed.len(), "released owned topics");

        failed
    }

    /// Forgets `topic` locally and releases its lease.
    ///
    /// # Errors
    /// Returns an error if the coordination store fails.
    pub async fn release(&self, topic: &str) -> Result<(), Error> {
        self.remove_topic(topic);

        self.coordination
            .release_topic_ownership(topic, &self.receiver_id)
            .await
            .map_err(Error::coordination)
    }

    /// Records that this receiver owns `topic`. Returns `true` if it was not already recorded.
    pub fn add_topic(&self, topic: &str) -> bool {
        self.owned.lock().insert(topic.to_string())
    }

    /// Forgets `topic` locally.
    pub fn remove_topic(&self, topic: &str) -> bool {
        self.owned.lock().remove(topic)
    }

    /// Whether `topic` is recorded as owned.
    pub fn owns_topic(&self, topic: &str) -> bool {
        self.owned.lock().contains(topic)
    }

    /// Owned topics, sorted.
    pub fn owned_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.owned.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of owned topics.
    pub fn owned_topic_count(&self) -> usize {
        self.owned.lock().len()
    }

    /// Subscribes to ownership-loss notifications.
    pub fn subscribe_losses(&self) -> broadcast::Receiver<String> {
        self.losses.subscribe()
    }
}
