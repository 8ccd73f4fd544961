//! Abstract interface for receiver liveness and topic ownership leases.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod lease;

pub use lease::{Lease, now_millis};

use std::error::Error;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for `CoordinationAdapter` errors
pub trait CoordinationError: Debug + Error + Send + Sync + 'static {}

/// Represents who currently holds a topic lease, from the point of view of one receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicOwnership {
    /// No live lease exists for the topic.
    Unowned,

    /// The lease is held by another receiver, identified by the String.
    OwnedByOther(String),

    /// The lease is held by the asking receiver.
    OwnedBySelf,
}

/// A store for receiver liveness records and single-writer topic leases.
///
/// Implementations must make `claim_topic_ownership` and `renew_topic_ownership` atomic with
/// respect to concurrent callers, including callers in other processes.
#[async_trait]
pub trait CoordinationAdapter: Clone + Debug + Send + Sync + 'static {
    /// The error type for coordination operations.
    type Error: CoordinationError;

    /// Registers (or refreshes) a receiver liveness record which expires after `ttl`.
    async fn register_receiver(&self, receiver_id: &str, ttl: Duration) -> Result<(), Self::Error>;

    /// Removes a receiver liveness record.
    async fn unregister_receiver(&self, receiver_id: &str) -> Result<(), Self::Error>;

    /// Lists all receivers whose liveness record has not expired.
    async fn get_active_receivers(&self) -> Result<Vec<String>, Self::Error>;

    /// Attempts to claim a topic for `receiver_id`.
    ///
    /// Returns `Ok(true)` iff no live lease existed and this caller won the claim. Among
    /// simultaneous claimants at most one may succeed.
    async fn claim_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error>;

    /// Gets the holder of the live lease on `topic`, if any.
    async fn get_topic_owner(&self, topic: &str) -> Result<Option<String>, Self::Error>;

    /// Releases the lease on `topic` if it is held by `receiver_id`.
    async fn release_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
    ) -> Result<(), Self::Error>;

    /// Extends the lease on `topic` by `ttl`.
    ///
    /// Returns `Ok(false)` if `receiver_id` is not the current holder or the lease already
    /// expired. Holders use this to detect ownership loss.
    async fn renew_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error>;

    /// Checks the status of a topic lease relative to `receiver_id`.
    async fn check_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
    ) -> Result<TopicOwnership, Self::Error> {
        Ok(match self.get_topic_owner(topic).await? {
            None => TopicOwnership::Unowned,
            Some(owner) if owner == receiver_id => TopicOwnership::OwnedBySelf,
            Some(owner) => TopicOwnership::OwnedByOther(owner),
        })
    }

    /// Releases any background resources held by the adapter.
    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}
