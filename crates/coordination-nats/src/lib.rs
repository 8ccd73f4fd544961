//! Implementation of coordination using NATS JetStream KV buckets.
//!
//! Every record is a JSON [`Lease`]. Claims and renewals are made atomic with revision-checked
//! writes: a claim is a `create` (fails if the key exists) or an `update` pinned to the revision
//! of the expired record it replaces; a renewal is an `update` pinned to the revision the holder
//! just read. Losing either race surfaces as a revision mismatch, which is reported as `false`.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::jetstream::kv::{Config as KvConfig, Entry, Operation, Store as KvStore};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use wire_coordination::{CoordinationAdapter, Lease, now_millis};

/// Options for configuring a `NatsCoordinationAdapter`.
#[derive(Clone, Debug)]
pub struct NatsCoordinationOptions {
    /// Prefix for the KV buckets (`{bucket}_receivers` and `{bucket}_topics`).
    pub bucket: String,

    /// The NATS client to use.
    pub client: Client,

    /// Number of replicas for the KV buckets. Should be at least 3 in production.
    pub num_replicas: usize,

    /// Timeout for individual KV operations. Defaults to 10 seconds if not set.
    pub operation_timeout: Option<Duration>,

    /// Whether to persist the buckets to disk.
    pub persist: bool,
}

/// A coordination adapter backed by NATS JetStream KV.
#[derive(Clone, Debug)]
pub struct NatsCoordinationAdapter {
    bucket: String,
    jetstream_context: JetStreamContext,
    num_replicas: usize,
    operation_timeout: Duration,
    persist: bool,
    receivers: Arc<OnceCell<KvStore>>,
    topics: Arc<OnceCell<KvStore>>,
}

/// Encodes an arbitrary identifier into a valid KV key.
fn encode_key(id: &str) -> String {
    hex::encode(id.as_bytes())
}

/// Decodes a live lease from a KV entry, treating deletes, purges and empty values as free.
fn live_lease(entry: &Entry, key: &str) -> Result<Option<Lease>, Error> {
    if !matches!(entry.operation, Operation::Put) {
        return Ok(None);
    }

    let lease = Lease::from_slice(&entry.value).map_err(|source| Error::InvalidRecord {
        key: key.to_string(),
        source,
    })?;

    Ok(lease.filter(|lease| lease.is_live_at(now_millis())))
}

fn encode_lease(lease: &Lease) -> Result<Bytes, Error> {
    lease.to_vec().map(Bytes::from).map_err(Error::Encode)
}

impl NatsCoordinationAdapter {
    /// Creates a new adapter. Buckets are created lazily on first use.
    #[must_use]
    pub fn new(
        NatsCoordinationOptions {
            bucket,
            client,
            num_replicas,
            operation_timeout,
            persist,
        }: NatsCoordinationOptions,
    ) -> Self {
        Self {
            bucket,
            jetstream_context: async_nats::jetstream::new(client),
            num_replicas,
            operation_timeout: operation_timeout.unwrap_or(Duration::from_secs(10)),
            persist,
            receivers: Arc::new(OnceCell::new()),
            topics: Arc::new(OnceCell::new()),
        }
    }

    async fn timed<F, R, E>(&self, operation: &'static str, future: F) -> Result<R, Error>
    where
        F: Future<Output = Result<R, E>> + Send,
        E: std::fmt::Display,
    {
        tokio::time::timeout(self.operation_timeout, future)
            .await
            .map_err(|_| Error::Timeout(operation))?
            .map_err(|e| Error::kv(operation, e))
    }

    async fn store(&self, cell: &OnceCell<KvStore>, suffix: &str) -> Result<KvStore, Error> {
        cell.get_or_try_init(|| async {
            let config = KvConfig {
                bucket: format!("{}_{suffix}", self.bucket),
                history: 1,
                num_replicas: self.num_replicas,
                storage: if self.persist {
                    async_nats::jetstream::stream::StorageType::File
                } else {
                    async_nats::jetstream::stream::StorageType::Memory
                },
                ..Default::default()
            };

            self.timed(
                "create_key_value",
                self.jetstream_context.create_key_value(config),
            )
            .await
        })
        .await
        .cloned()
    }

    async fn receivers_store(&self) -> Result<KvStore, Error> {
        self.store(&self.receivers, "receivers").await
    }

    async fn topics_store(&self) -> Result<KvStore, Error> {
        self.store(&self.topics, "topics").await
    }

    async fn entry(&self, store: &KvStore, key: &str) -> Result<Option<Entry>, Error> {
        self.timed("entry", store.entry(key)).await
    }

    /// Checks whether a failed conditional write lost a race (the record moved past
    /// `expected_revision`) rather than failing outright.
    async fn lost_race(
        &self,
        store: &KvStore,
        key: &str,
        expected_revision: Option<u64>,
    ) -> Result<bool, Error> {
        let current = self.entry(store, key).await?;

        Ok(match (current, expected_revision) {
            (Some(entry), Some(revision)) => entry.revision != revision,
            (Some(_), None) => true,
            (None, _) => false,
        })
    }
}

#[async_trait]
impl CoordinationAdapter for NatsCoordinationAdapter {
    type Error = Error;

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn register_receiver(&self, receiver_id: &str, ttl: Duration) -> Result<(), Error> {
        let store = self.receivers_store().await?;
        let value = encode_lease(&Lease::new(receiver_id, ttl))?;

        self.timed("put", store.put(encode_key(receiver_id), value))
            .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn unregister_receiver(&self, receiver_id: &str) -> Result<(), Error> {
        let store = self.receivers_store().await?;

        self.timed("delete", store.delete(encode_key(receiver_id)))
            .await
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_active_receivers(&self) -> Result<Vec<String>, Error> {
        let store = self.receivers_store().await?;

        let keys = self
            .timed("keys", async {
                store
                    .keys()
                    .await
                    .map_err(|e| e.to_string())?
                    .try_collect::<Vec<String>>()
                    .await
                    .map_err(|e| e.to_string())
            })
            .await?;

        let mut receivers = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.entry(&store, &key).await? {
                match live_lease(&entry, &key) {
                    Ok(Some(lease)) => receivers.push(lease.holder),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "skipping unreadable receiver record"),
                }
            }
        }
        receivers.sort_unstable();

        Ok(receivers)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn claim_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let store = self.topics_store().await?;
        let key = encode_key(topic);
        let value = encode_lease(&Lease::new(receiver_id, ttl))?;

        match self.entry(&store, &key).await? {
            None => match self.timed("create", store.create(&key, value)).await {
                Ok(revision) => {
                    info!(topic, receiver_id, revision, "topic claimed via create");
                    Ok(true)
                }
                Err(e) => {
                    if self.lost_race(&store, &key, None).await? {
                        debug!(topic, receiver_id, "topic claimed concurrently by another");
                        Ok(false)
                    } else {
                        Err(e)
                    }
                }
            },
            Some(entry) => {
                if live_lease(&entry, &key)?.is_some() {
                    return Ok(false);
                }

                match self
                    .timed("update", store.update(&key, value, entry.revision))
                    .await
                {
                    Ok(revision) => {
                        info!(
                            topic,
                            receiver_id,
                            old_revision = entry.revision,
                            revision,
                            "topic claimed over expired lease"
                        );
                        Ok(true)
                    }
                    Err(e) => {
                        if self.lost_race(&store, &key, Some(entry.revision)).await? {
                            debug!(topic, receiver_id, "expired lease replaced by another");
                            Ok(false)
                        } else {
                            Err(e)
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_topic_owner(&self, topic: &str) -> Result<Option<String>, Error> {
        let store = self.topics_store().await?;
        let key = encode_key(topic);

        match self.entry(&store, &key).await? {
            Some(entry) => Ok(live_lease(&entry, &key)?.map(|lease| lease.holder)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn release_topic_ownership(&self, topic: &str, receiver_id: &str) -> Result<(), Error> {
        let store = self.topics_store().await?;
        let key = encode_key(topic);

        let Some(entry) = self.entry(&store, &key).await? else {
            return Ok(());
        };

        if !live_lease(&entry, &key)?.is_some_and(|lease| lease.holder == receiver_id) {
            debug!(topic, receiver_id, "not releasing lease held by another");
            return Ok(());
        }

        // An empty value marks the lease free; pinning the revision avoids clobbering a
        // lease claimed between the read and this write.
        match self
            .timed("update", store.update(&key, Bytes::new(), entry.revision))
            .await
        {
            Ok(_) => {
                info!(topic, receiver_id, "topic released");
                Ok(())
            }
            Err(e) => {
                if self.lost_race(&store, &key, Some(entry.revision)).await? {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn renew_topic_ownership(
        &self,
        topic: &str,
        receiver_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let store = self.topics_store().await?;
        let key = encode_key(topic);

        let Some(entry) = self.entry(&store, &key).await? else {
            return Ok(false);
        };

        if !live_lease(&entry, &key)?.is_some_and(|lease| lease.holder == receiver_id) {
            return Ok(false);
        }

        let value = encode_lease(&Lease::new(receiver_id, ttl))?;
        match self
            .timed("update", store.update(&key, value, entry.revision))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if self.lost_race(&store, &key, Some(entry.revision)).await? {
                    warn!(topic, receiver_id, "lease changed during renewal");
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }
}
