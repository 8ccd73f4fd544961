//! Receiver, sender and conduit configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_WIRE_ID: &str = "default";

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Namespace shared by the senders and receivers of one wire
    pub wire_id: String,

    /// Receiver identity (random UUID if not set)
    pub receiver_id: Option<String>,

    /// How often the liveness record is refreshed
    pub heartbeat_interval: Duration,

    /// Lifetime of the liveness record
    pub heartbeat_ttl: Duration,

    /// Lease duration granted on each ownership renewal
    pub topic_ownership_ttl: Duration,

    /// How often owned topics are renewed
    pub ownership_renewal_interval: Duration,

    /// How long responses stay cached for idempotent retries
    pub message_cache_ttl: Duration,

    /// Maximum number of cached responses
    pub message_cache_size: usize,

    /// How often expired cached responses are swept
    pub message_cache_sweep_interval: Duration,

    /// Lead time before a request's deadline at which an extension is sent
    pub timeout_extension_threshold: Duration,

    /// Time granted by each extension (defaults to the request's own timeout)
    pub timeout_extension: Option<Duration>,

    /// How often failed lease releases and unsubscribes are retried
    pub teardown_retry_interval: Duration,

    /// Attempts before a failed release or unsubscribe is given up
    pub teardown_max_attempts: u32,
}

impl ReceiverConfig {
    /// Default configuration on the given wire.
    #[must_use]
    pub fn new(wire_id: impl Into<String>) -> Self {
        Self {
            wire_id: wire_id.into(),
            ..Self::default()
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            wire_id: DEFAULT_WIRE_ID.to_string(),
            receiver_id: None,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            topic_ownership_ttl: Duration::from_secs(30),
            ownership_renewal_interval: Duration::from_secs(10),
            message_cache_ttl: Duration::from_secs(300),
            message_cache_size: 10_000,
            message_cache_sweep_interval: Duration::from_secs(60),
            timeout_extension_threshold: Duration::from_secs(5),
            timeout_extension: None,
            teardown_retry_interval: Duration::from_secs(1),
            teardown_max_attempts: 10,
        }
    }
}

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Namespace shared by the senders and receivers of one wire
    pub wire_id: String,

    /// Timeout used when `send` is not given one
    pub default_timeout: Duration,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Backoff before the first retry
    pub retry_backoff: Duration,

    /// Backoff growth per attempt
    pub retry_backoff_multiplier: f64,

    /// Upper bound for a single backoff
    pub max_retry_backoff: Duration,

    /// Concurrent sends allowed before new ones are rejected
    pub max_in_flight_messages: usize,

    /// Lease duration used when a sender claims a topic for a receiver
    pub ownership_claim_ttl: Duration,

    /// How often failed unsubscribes are retried
    pub teardown_retry_interval: Duration,

    /// Attempts before a failed unsubscribe is given up
    pub teardown_max_attempts: u32,
}

impl SenderConfig {
    /// Default configuration on the given wire.
    #[must_use]
    pub fn new(wire_id: impl Into<String>) -> Self {
        Self {
            wire_id: wire_id.into(),
            ..Self::default()
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            wire_id: DEFAULT_WIRE_ID.to_string(),
            default_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_multiplier: 2.0,
            max_retry_backoff: Duration::from_secs(10),
            max_in_flight_messages: 1000,
            ownership_claim_ttl: Duration::from_secs(30),
            teardown_retry_interval: Duration::from_secs(1),
            teardown_max_attempts: 10,
        }
    }
}

/// Per-topic lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitConfig {
    /// How often topic TTLs are checked
    pub ttl_check_interval: Duration,

    /// Messages that may queue while a topic is being set up
    pub max_pending_messages: usize,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            ttl_check_interval: Duration::from_secs(1),
            max_pending_messages: 1024,
        }
    }
}
