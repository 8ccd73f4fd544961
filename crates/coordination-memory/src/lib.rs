//! In-memory (single process) implementation of coordination for local development and tests.
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
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use wire_coordination::CoordinationAdapter;

/// How often expired receivers and leases are swept by default.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct TopicLease {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    receivers: HashMap<String, Instant>,
    topics: HashMap<String, TopicLease>,
}

impl State {
    fn sweep(&mut self, now: Instant) -> (usize, usize) {
        let receivers_before = self.receivers.len();
        let topics_before = self.topics.len();

        self.receivers.retain(|_, expires_at| *expires_at > now);
        self.topics.retain(|_, lease| lease.expires_at > now);

        (
            receivers_before - self.receivers.len(),
            topics_before - self.topics.len(),
        )
    }

    fn live_lease(&self, topic: &str, now: Instant) -> Option<&TopicLease> {
        self.topics
            .get(topic)
            .filter(|lease| lease.expires_at > now)
    }
}

/// In-memory coordination adapter.
///
/// Construct one per process and share it (clones share state) between every sender and
/// receiver that should see the same leases. A single lock around all state makes claims and
/// renewals atomic; expiry is enforced on every read and by a periodic sweep.
#[derive(Clone, Debug)]
pub struct MemoryCoordinationAdapter {
    closed: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    state: Arc<Mutex<State>>,
}

impl Default for MemoryCoordinationAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationAdapter {
    /// Creates a new adapter sweeping expired entries every [`DEFAULT_SWEEP_INTERVAL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Creates a new adapter with a custom sweep interval.
    ///
    /// The sweep task is only started when called from within a Tokio runtime; outside of one
    /// expiry is still enforced lazily on every operation.
    #[must_use]
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        let adapter = Self {
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_token: CancellationToken::new(),
            state: Arc::new(Mutex::new(State::default())),
        };

        if let Ok(handle) = Handle::try_current() {
            handle.spawn(Self::sweep_loop(
                adapter.state.clone(),
                sweep_interval,
                adapter.shutdown_token.clone(),
            ));
        }

        adapter
    }

    async fn sweep_loop(
        state: Arc<Mutex<State>>,
        sweep_interval: Duration,
        shutdown_token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown_token.cancelled() => {
                    debug!("coordination sweep stopped");
                    break;
                }
                _ = interval.tick() => {
                    let (receivers, topics) = state.lock().await.sweep(Instant::now());
                    if receivers > 0 || topics > 0 {
                        trace!(receivers, topics, "swept expired coordination entries");
                    }
                }
            }
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        Ok(())
    }
}

#[async_trait]
impl CoordinationAdapter for MemoryCoordinationAdapter {
    type Error = Error;

    async fn register_receiver(&self, receiver_id: &str, ttl: Duration) -> Result<(), Error> {
        self.ensure_open()?;

        self.state
            .lock()
            .await
            .receivers
            .insert(receiver_id.to_string(), Instant::now() + ttl);

        Ok(())
    }

    async fn unregister_receiver(&self, receiver_id: &str) -> Result<(), Error> {
        self.ensure_open()?;

        self.state.lock().await.receivers.remove(receiver_id);

        Ok(())
    }

    async fn get_active_receivers(&self) -> Result<Vec<String>, Error> {
        self.ensure_open()?;

        let now = Instant::now();
        let mut receivers = self
            .state
            .lock()
            .await
            .receivers
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        receivers.sort_unstable();

        Ok(receivers)
    }

    async fn claim_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        self.ensure_open()?;

        let now = Instant::now();
        let mut state = self.state.lock().await;

        if state.live_lease(topic, now).is_some() {
            return Ok(false);
        }

        state.topics.insert(
            topic.to_string(),
            TopicLease {
                holder: receiver_id.to_string(),
                expires_at: now + ttl,
            },
        );
        drop(state);

        debug!(topic, receiver_id, "topic claimed");

        Ok(true)
    }

    async fn get_topic_owner(&self, topic: &str) -> Result<Option<String>, Error> {
        self.ensure_open()?;

        Ok(self
            .state
            .lock()
            .await
            .live_lease(topic, Instant::now())
            .map(|lease| lease.holder.clone()))
    }

    async fn release_topic_ownership(&self, topic: &str, receiver_id: &str) -> Result<(), Error> {
        self.ensure_open()?;

        let mut state = self.state.lock().await;
        if state
            .topics
            .get(topic)
            .is_some_and(|lease| lease.holder == receiver_id)
        {
            state.topics.remove(topic);
            debug!(topic, receiver_id, "topic released");
        }

        Ok(())
    }

    async fn renew_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        self.ensure_open()?;

        let now = Instant::now();
        let mut state = self.state.lock().await;

        match state.topics.get_mut(topic) {
            Some(lease) if lease.holder == receiver_id && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        self.shutdown_token.cancel();

        let mut state = self.state.lock().await;
        state.receivers.clear();
        state.topics.clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use wire_coordination::TopicOwnership;

    const TTL: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_register_and_unregister_receiver() {
        let adapter = MemoryCoordinationAdapter::new();

        adapter.register_receiver("r1", TTL).await.unwrap();
        adapter.register_receiver("r2", TTL).await.unwrap();
        assert_eq!(
            adapter.get_active_receivers().await.unwrap(),
            vec!["r1".to_string(), "r2".to_string()]
        );

        adapter.unregister_receiver("r1").await.unwrap();
        assert_eq!(
            adapter.get_active_receivers().await.unwrap(),
            vec!["r2".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_registration_expires() {
        let adapter = MemoryCoordinationAdapter::new();

        adapter.register_receiver("r1", TTL).await.unwrap();
        tokio::time::advance(TTL + Duration::from_millis(1)).await;

        assert!(adapter.get_active_receivers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let adapter = MemoryCoordinationAdapter::new();

        assert!(adapter.claim_topic_ownership("t", "r1", TTL).await.unwrap());
        assert!(!adapter.claim_topic_ownership("t", "r2", TTL).await.unwrap());
        assert!(!adapter.claim_topic_ownership("t", "r1", TTL).await.unwrap());
        assert_eq!(
            adapter.get_topic_owner("t").await.unwrap(),
            Some("r1".to_string())
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let adapter = MemoryCoordinationAdapter::new();

        let claims = (0..16).map(|i| {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                adapter
                    .claim_topic_ownership("contended", &format!("r{i}"), TTL)
                    .await
                    .unwrap()
            })
        });

        let winners = futures::future::join_all(claims)
            .await
            .into_iter()
            .filter(|won| *won.as_ref().unwrap())
            .count();

        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_claimable() {
        let adapter = MemoryCoordinationAdapter::new();

        assert!(adapter.claim_topic_ownership("t", "r1", TTL).await.unwrap());
        tokio::time::advance(TTL + Duration::from_millis(1)).await;

        assert_eq!(adapter.get_topic_owner("t").await.unwrap(), None);
        assert!(adapter.claim_topic_ownership("t", "r2", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_and_detects_loss() {
        let adapter = MemoryCoordinationAdapter::new();

        assert!(adapter.claim_topic_ownership("t", "r1", TTL).await.unwrap());

        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(adapter.renew_topic_ownership("t", "r1", TTL).await.unwrap());
        assert!(!adapter.renew_topic_ownership("t", "r2", TTL).await.unwrap());

        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(
            adapter.get_topic_owner("t").await.unwrap(),
            Some("r1".to_string())
        );

        tokio::time::advance(TTL).await;
        assert!(!adapter.renew_topic_ownership("t", "r1", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let adapter = MemoryCoordinationAdapter::new();

        assert!(adapter.claim_topic_ownership("t", "r1", TTL).await.unwrap());

        adapter.release_topic_ownership("t", "r2").await.unwrap();
        assert_eq!(
            adapter.check_topic_ownership("t", "r2").await.unwrap(),
            TopicOwnership::OwnedByOther("r1".to_string())
        );

        adapter.release_topic_ownership("t", "r1").await.unwrap();
        assert_eq!(
            adapter.check_topic_ownership("t", "r1").await.unwrap(),
            TopicOwnership::Unowned
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_entries() {
        let adapter = MemoryCoordinationAdapter::with_sweep_interval(Duration::from_millis(10));

        adapter.register_receiver("r1", TTL).await.unwrap();
        assert!(adapter.claim_topic_ownership("t", "r1", TTL).await.unwrap());

        tokio::time::sleep(TTL * 2).await;

        let state = adapter.state.lock().await;
        assert!(state.receivers.is_empty());
        assert!(state.topics.is_empty());
    }

    #[tokio::test]
    async fn test_closed_adapter_rejects_operations() {
        let adapter = MemoryCoordinationAdapter::new();
        adapter.close().await.unwrap();

        assert!(matches!(
            adapter.register_receiver("r1", TTL).await,
            Err(Error::Closed)
        ));
    }
}
