//! Expiration record map.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Tracks the absolute expiry instant of each key that was given a TTL.
#[derive(Default)]
pub struct ExpirationTracker {
    records: DashMap<String, Instant>,
}

impl ExpirationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `now + ttl` for `key`, replacing any earlier record.
    pub fn set_expiration(&self, key: &str, ttl: Duration) {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .unwrap_or_else(far_future);
        self.records.insert(key.to_string(), expires_at);
    }

    /// Drop the record for `key`. Returns whether one existed.
    pub fn clear_expiration(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    /// Drop the record for `key` only if it has expired.
    pub fn clear_if_expired(&self, key: &str) -> bool {
        let now = Instant::now();
        self.records
            .remove_if(key, |_, expires_at| now >= *expires_at)
            .is_some()
    }

    /// True iff a record exists and its instant has been reached.
    ///
    /// The boundary is inclusive: reaching `expires_at` counts as expired,
    /// not only passing it. A zero TTL is therefore expired from the moment
    /// it is recorded, whatever the clock resolution.
    pub fn is_expired(&self, key: &str) -> bool {
        self.records
            .get(key)
            .map(|expires_at| Instant::now() >= *expires_at)
            .unwrap_or(false)
    }

    /// The recorded expiry instant, if any.
    pub fn expires_at(&self, key: &str) -> Option<Instant> {
        self.records.get(key).map(|r| *r)
    }

    /// Time left before `key` expires. `None` when the key has no record;
    /// `Some(Duration::ZERO)` once it has expired.
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        self.expires_at(key)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Keys whose records have expired, in no particular order.
    pub fn expired_keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.records
            .iter()
            .filter(|r| now >= *r.value())
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

/// Stand-in for TTLs too large to add to `Instant::now()`.
fn far_future() -> Instant {
    // Roughly thirty years; well past any process lifetime.
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}
