//! Core types for the register.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Unique identifier for a change subscription.
///
/// Ids are drawn from a single counter, so they also encode registration
/// order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A stored value together with the time it was last written.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub updated_at: Timestamp,
}

impl Entry {
    /// Create an entry stamped with the current time.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            updated_at: Timestamp::now(),
        }
    }
}

/// How the handlers of a changed key are invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// One handler at a time, in registration order.
    Serial,
    /// Every handler on its own thread; completes when all have finished.
    Concurrent,
    /// Serial for quiet keys, Concurrent once subscriber count or update
    /// rate crosses the configured thresholds.
    Hybrid,
}

impl Default for DispatchStrategy {
    fn default() -> Self {
        DispatchStrategy::Hybrid
    }
}

/// Point-in-time counters describing a register.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterStats {
    /// Keys currently held (expired but not yet evicted keys included).
    pub keys: usize,
    /// Keys carrying an expiration record.
    pub expiring_keys: usize,
    /// Total registered subscriptions across all keys.
    pub subscriptions: usize,
    /// Sets recorded in the current rate window.
    pub update_rate: u64,
}
