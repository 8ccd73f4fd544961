use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Response;

#[derive(Debug)]
struct CacheEntry {
    response: Response,
    expires_at: Instant,
}

/// Bounded, TTL'd store of `message_id -> Response`.
///
/// When full, the oldest inserted entry is evicted. Expired entries are dropped lazily on read
/// and periodically by the sweeper.
#[derive(Clone, Debug)]
pub struct MessageCache {
    entries: Arc<Mutex<IndexMap<String, CacheEntry>>>,
    max_size: usize,
    shutdown_token: Arc<Mutex<Option<CancellationToken>>>,
    ttl: Duration,
}

impl MessageCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(IndexMap::new())),
            max_size,
            shutdown_token: Arc::new(Mutex::new(None)),
            ttl,
        }
    }

    /// Caches a response, evicting the oldest entry if the cache is full.
    pub fn set(&self, message_id: impl Into<String>, response: Response) {
        if self.max_size == 0 {
            return;
        }

        let message_id = message_id.into();
        let mut entries = self.entries.lock();

        entries.shift_remove(&message_id);
        while entries.len() >= self.max_size {
            entries.shift_remove_index(0);
        }

        entries.insert(
            message_id,
            CacheEntry {
                response,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Gets a live cached response.
    pub fn get(&self, message_id: &str) -> Option<Response> {
        let mut entries = self.entries.lock();

        match entries.get(message_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.response.clone()),
            Some(_) => {
                entries.shift_remove(message_id);
                None
            }
            None => None,
        }
    }

    /// Whether a live response is cached.
    pub fn has(&self, message_id: &str) -> bool {
        self.get(message_id).is_some()
    }

    /// Removes a cached response.
    pub fn delete(&self, message_id: &str) -> bool {
        self.entries.lock().shift_remove(message_id).is_some()
    }

    /// Removes every cached response.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);

        before - entries.len()
    }

    /// Starts the periodic sweep, replacing any running sweeper.
    pub fn start_sweeper(&self, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.shutdown_token.lock().replace(token.clone()) {
            previous.cancel();
        }

        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "swept expired responses");
                        }
                    }
                }
            }
        });
    }

    /// Stops the periodic sweep. Cached entries are kept.
    pub fn stop_sweeper(&self) {
        if let Some(token) = self.shutdown_token.lock().take() {
            token.cancel();
        }
    }

    /// Stops the sweeper and drops every entry.
    pub fn destroy(&self) {
        self.stop_sweeper();
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str) -> Response {
        Response::success(id, json!(id))
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_inserted() {
        let cache = MessageCache::new(2, Duration::from_secs(60));

        cache.set("a", response("a"));
        cache.set("b", response("b"));
        // Reads do not refresh position.
        assert!(cache.has("a"));
        cache.set("c", response("c"));

        assert!(!cache.has("a"));
        assert!(cache.has("b"));
        assert!(cache.has("c"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry() {
        let cache = MessageCache::new(10, Duration::from_millis(100));
        cache.set("a", response("a"));

        tokio::time::advance(Duration::from_millis(101)).await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired() {
        let cache = MessageCache::new(10, Duration::from_millis(100));
        cache.set("a", response("a"));
        cache.start_sweeper(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(160)).await;

        assert!(cache.is_empty());
        cache.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_clear() {
        let cache = MessageCache::new(10, Duration::from_secs(1));
        cache.set("a", response("a"));
        cache.set("b", response("b"));

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();

        assert!(cache.is_empty());
    }
}
