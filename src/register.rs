//! Main Register struct tying all components together.

use crate::callbacks::{
    Callback, CallbackRegistry, DispatchPolicy, DispatchSummary, SubscriptionHandle, UpdateRate,
};
use crate::error::{RegisterError, Result};
use crate::expiration::ExpirationTracker;
use crate::snapshot::{Snapshot, SnapshotFormat};
use crate::types::{DispatchStrategy, Entry, RegisterStats, SubscriptionId};
use crate::values::{MemoryStore, ValueStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Register configuration.
#[derive(Clone, Debug)]
pub struct RegisterConfig {
    /// Hybrid dispatch stays serial while a key has fewer subscribers.
    /// Default: 10
    pub callback_count_threshold: usize,

    /// Hybrid dispatch stays serial while fewer Sets than this landed in
    /// the current rate window.
    /// Default: 100
    pub update_rate_threshold: u64,

    /// Length of the update rate window.
    /// Default: 1s
    pub update_rate_window: Duration,

    /// Deadline for concurrent dispatch (None = wait for every handler).
    pub handler_timeout: Option<Duration>,

    /// Strategy used by [`Register::set`] and friends.
    /// Default: Hybrid
    pub default_strategy: DispatchStrategy,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            callback_count_threshold: 10,
            update_rate_threshold: 100,
            update_rate_window: Duration::from_secs(1),
            handler_timeout: None,
            default_strategy: DispatchStrategy::Hybrid,
        }
    }
}

impl RegisterConfig {
    pub fn with_callback_count_threshold(mut self, threshold: usize) -> Self {
        self.callback_count_threshold = threshold;
        self
    }

    pub fn with_update_rate_threshold(mut self, threshold: u64) -> Self {
        self.update_rate_threshold = threshold;
        self
    }

    pub fn with_update_rate_window(mut self, window: Duration) -> Self {
        self.update_rate_window = window;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_default_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            callback_count_threshold: self.callback_count_threshold,
            update_rate_threshold: self.update_rate_threshold,
            handler_timeout: self.handler_timeout,
        }
    }
}

/// A shared, thread-safe key-value register with change notifications.
///
/// Provides a unified interface for:
/// - Adding, setting, reading and removing typed values
/// - Per-key TTLs, evicted lazily when a read finds them expired
/// - Change handlers dispatched on every Set
/// - Snapshots of the full mapping
///
/// Own one instance at the composition root and hand out `Arc<Register>`.
pub struct Register<S: ValueStore = MemoryStore> {
    config: RegisterConfig,
    values: S,
    expirations: ExpirationTracker,
    callbacks: CallbackRegistry,
    update_rate: UpdateRate,
}

impl Register<MemoryStore> {
    /// Create a register with default configuration.
    pub fn new() -> Self {
        Self::with_config(RegisterConfig::default())
    }

    pub fn with_config(config: RegisterConfig) -> Self {
        Self::with_store(MemoryStore::new(), config)
    }
}

impl Default for Register<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ValueStore> Register<S> {
    /// Create a register over a custom value store.
    pub fn with_store(values: S, config: RegisterConfig) -> Self {
        Self {
            callbacks: CallbackRegistry::with_policy(config.dispatch_policy()),
            update_rate: UpdateRate::new(config.update_rate_window),
            expirations: ExpirationTracker::new(),
            values,
            config,
        }
    }

    pub fn config(&self) -> &RegisterConfig {
        &self.config
    }

    // --- Writes ---

    /// Add a new key. Fails with `AlreadyExists` if the key is present.
    ///
    /// Adding never notifies subscribers.
    pub fn add<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        self.add_value(key, to_value(value)?, None)
    }

    /// Add a new key that expires after `ttl`.
    pub fn add_with_ttl<T: Serialize>(&self, key: &str, value: T, ttl: Duration) -> Result<()> {
        self.add_value(key, to_value(value)?, Some(ttl))
    }

    fn add_value(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        // A fresh entry never inherits the expiry of an earlier one. The
        // record is reset before the key unlocks, so a reader evicting under
        // the same lock never sees the new value with a stale record.
        self.values.add_then(key, value, &|| match ttl {
            Some(ttl) => self.expirations.set_expiration(key, ttl),
            None => {
                self.expirations.clear_expiration(key);
            }
        })
    }

    /// Replace the value of an existing key and notify its subscribers
    /// using the configured default strategy.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<DispatchSummary> {
        self.set_with(key, value, None, self.config.default_strategy)
    }

    /// Like [`set`](Self::set), also resetting the key's TTL.
    pub fn set_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: T,
        ttl: Duration,
    ) -> Result<DispatchSummary> {
        self.set_with(key, value, Some(ttl), self.config.default_strategy)
    }

    /// Like [`set`](Self::set), dispatching concurrently.
    pub fn set_concurrent<T: Serialize>(&self, key: &str, value: T) -> Result<DispatchSummary> {
        self.set_with(key, value, None, DispatchStrategy::Concurrent)
    }

    /// Replace the value of an existing key, optionally reset its TTL, then
    /// dispatch to its subscribers.
    ///
    /// The new value is visible to readers before any handler runs. A
    /// `HandlerFailure` is returned only after every handler was attempted
    /// and never undoes the write. Without a `ttl` the key keeps whatever
    /// expiration it had.
    pub fn set_with<T: Serialize>(
        &self,
        key: &str,
        value: T,
        ttl: Option<Duration>,
        strategy: DispatchStrategy,
    ) -> Result<DispatchSummary> {
        self.set_value(key, to_value(value)?, ttl, strategy)
    }

    fn set_value(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        strategy: DispatchStrategy,
    ) -> Result<DispatchSummary> {
        self.values.set_then(key, value.clone(), &|| {
            if let Some(ttl) = ttl {
                self.expirations.set_expiration(key, ttl);
            }
        })?;

        let rate = self.update_rate.record();
        self.callbacks.dispatch(key, &value, strategy, rate)
    }

    /// Add each pair in order. Stops at the first failure; pairs before
    /// it stay added. Returns the number added.
    pub fn add_range<I, K, T>(&self, items: I, ttl: Option<Duration>) -> Result<usize>
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: Serialize,
    {
        let mut applied = 0;
        for (key, value) in items {
            self.add_value(key.as_ref(), to_value(value)?, ttl)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Set each pair in order, dispatching per key. Stops at the first
    /// failure, including a handler failure; pairs before it stay set.
    /// Returns the number set.
    pub fn set_range<I, K, T>(
        &self,
        items: I,
        ttl: Option<Duration>,
        strategy: DispatchStrategy,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: Serialize,
    {
        let mut applied = 0;
        for (key, value) in items {
            self.set_value(key.as_ref(), to_value(value)?, ttl, strategy)?;
            applied += 1;
        }
        Ok(applied)
    }

    // --- Reads ---

    /// Read `key` as `T`.
    ///
    /// Fails with `NotFound` if the key is absent or expired (an expired
    /// key is evicted on the way) and with `TypeMismatch` if the stored
    /// value does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let entry = self.get_entry(key)?;
        serde_json::from_value(entry.value).map_err(|e| RegisterError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    /// Read `key` as `T`, falling back to `default` when it is absent,
    /// expired or of another shape.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Read the raw stored value.
    pub fn get_value(&self, key: &str) -> Result<Value> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Read the raw entry, including its last write time.
    pub fn get_entry(&self, key: &str) -> Result<Entry> {
        if self.evict_if_expired(key) {
            return Err(RegisterError::NotFound(key.to_string()));
        }
        self.values.get(key)
    }

    /// Evict `key` if its TTL has run out. Returns true if the key must be
    /// treated as absent.
    fn evict_if_expired(&self, key: &str) -> bool {
        if !self.expirations.is_expired(key) {
            return false;
        }

        // The record is checked and dropped under the value's lock, so a
        // concurrent Add or set_with_ttl either happened before (and the
        // check fails) or waits for the eviction to finish.
        let evicted = self
            .values
            .remove_if(key, &|_| self.expirations.clear_if_expired(key));

        if evicted.is_some() {
            debug!(key, "evicted expired key");
        }
        evicted.is_some()
    }

    /// Whether `key` is stored.
    ///
    /// No expiration check happens here: an expired key is reported
    /// present until a read evicts it.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains(key)
    }

    /// All stored keys, in no particular order.
    pub fn list_keys(&self) -> Vec<String> {
        self.values.keys()
    }

    /// Time left before `key` expires, if it has a TTL.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.expirations.remaining(key)
    }

    // --- Removal ---

    /// Remove `key`, returning its value. Fails with `NotFound` if absent.
    pub fn remove(&self, key: &str) -> Result<Value> {
        self.values.remove(key).map(|entry| entry.value)
    }

    /// Remove every expired key now. Returns the number evicted.
    pub fn purge_expired(&self) -> usize {
        let evicted = self
            .expirations
            .expired_keys()
            .into_iter()
            .filter(|key| {
                self.values
                    .remove_if(key, &|_| self.expirations.clear_if_expired(key))
                    .is_some()
            })
            .count();

        if evicted > 0 {
            debug!(evicted, "purged expired keys");
        }
        evicted
    }

    /// Empty the register: values, expirations and subscriptions.
    pub fn clear(&self) {
        self.values.clear();
        self.expirations.clear();
        self.callbacks.clear();
    }

    // --- Subscriptions ---

    /// Call `handler` with the new value whenever `key` is set.
    ///
    /// The key does not need to exist yet.
    pub fn register(&self, key: &str, handler: Callback) -> SubscriptionId {
        self.callbacks.register(key, handler)
    }

    /// Remove the first registration of `handler` on `key`.
    pub fn remove_callback(&self, key: &str, handler: &Callback) -> bool {
        self.callbacks.remove_one(key, handler)
    }

    /// Remove every subscription on `key`. Returns how many were removed.
    pub fn remove_all_callbacks(&self, key: &str) -> usize {
        self.callbacks.remove_all(key)
    }

    /// Receive change events for `key` on a bounded channel.
    pub fn subscribe(&self, key: &str, buffer_size: usize) -> SubscriptionHandle {
        self.callbacks.subscribe(key, buffer_size)
    }

    /// Remove a subscription by id.
    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        self.callbacks.unsubscribe(key, id)
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.callbacks.subscriber_count(key)
    }

    pub fn stats(&self) -> RegisterStats {
        RegisterStats {
            keys: self.values.len(),
            expiring_keys: self.expirations.len(),
            subscriptions: self.callbacks.subscription_count(),
            update_rate: self.update_rate.current(),
        }
    }

    // --- Snapshots ---

    /// Capture every live (unexpired) key.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let entries: BTreeMap<String, Value> = self
            .values
            .entries()
            .into_iter()
            .filter(|(key, _)| !self.expirations.is_expired(key))
            .map(|(key, entry)| (key, entry.value))
            .collect();
        Snapshot::new(entries)
    }

    /// Write a snapshot to `path`.
    pub fn save_snapshot(&self, path: impl AsRef<Path>, format: SnapshotFormat) -> Result<usize> {
        let snapshot = self.snapshot()?;
        snapshot.save(path.as_ref(), format)?;
        debug!(path = %path.as_ref().display(), entries = snapshot.len(), "saved snapshot");
        Ok(snapshot.len())
    }

    /// Write a snapshot to `writer`.
    pub fn write_snapshot<W: Write>(&self, writer: W, format: SnapshotFormat) -> Result<usize> {
        let snapshot = self.snapshot()?;
        snapshot.write_to(writer, format)?;
        Ok(snapshot.len())
    }

    /// Merge the snapshot at `path` into the register.
    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        let snapshot = Snapshot::load(path.as_ref())?;
        debug!(path = %path.as_ref().display(), entries = snapshot.len(), "loaded snapshot");
        self.restore(snapshot)
    }

    /// Merge a snapshot read from `reader` into the register.
    pub fn read_snapshot<R: Read>(&self, reader: R) -> Result<usize> {
        self.restore(Snapshot::read_from(reader)?)
    }

    /// Merge `snapshot` into the register.
    ///
    /// Loaded keys overwrite existing ones and lose any TTL. Subscribers
    /// are not notified.
    pub fn restore(&self, snapshot: Snapshot) -> Result<usize> {
        snapshot.verify()?;
        let count = snapshot.len();
        for (key, value) in snapshot.entries {
            self.values.upsert_then(&key, value, &|| {
                self.expirations.clear_expiration(&key);
            });
        }
        Ok(count)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(RegisterError::from)
}
