use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the UNIX epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// A time-bounded claim, as persisted by external coordination backends.
///
/// Used both for topic leases and for receiver liveness records (where `holder` is the
/// receiver itself).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// The receiver holding the claim.
    pub holder: String,

    /// When the claim lapses (milliseconds since UNIX epoch).
    pub expires_at_ms: u64,
}

impl Lease {
    /// Creates a lease for `holder` expiring `ttl` from now.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            holder: holder.into(),
            expires_at_ms: now_millis().saturating_add(ttl.as_millis() as u64),
        }
    }

    /// Whether the lease is still live at `now_ms`.
    #[must_use]
    pub const fn is_live_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }

    /// Whether the lease is still live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.is_live_at(now_millis())
    }

    /// Whether the lease is live and held by `holder`.
    #[must_use]
    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder && self.is_live()
    }

    /// Encodes the lease for storage.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a stored lease. An empty value is a released (free) lease and decodes to `None`.
    ///
    /// # Errors
    /// Returns an error if the value is not a valid lease record.
    pub fn from_slice(value: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        if value.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(value).map(Some)
    }
}
