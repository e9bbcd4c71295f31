//! In-memory value store backed by a sharded concurrent map.

use crate::error::{RegisterError, Result};
use crate::types::Entry;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde_json::Value;

/// Storage seam used by the register.
///
/// Implementations must be internally synchronized: callers share one
/// instance across threads without any outer lock.
pub trait ValueStore: Send + Sync {
    /// Insert a new key, running `on_commit` while the key is still locked.
    /// Fails with `AlreadyExists` if the key is present; `on_commit` does
    /// not run then.
    fn add_then(&self, key: &str, value: Value, on_commit: &dyn Fn()) -> Result<()>;

    /// Replace the value of an existing key, running `on_commit` while the
    /// key is still locked. Fails with `NotFound` otherwise.
    fn set_then(&self, key: &str, value: Value, on_commit: &dyn Fn()) -> Result<()>;

    /// Insert or replace without any presence requirement, running
    /// `on_commit` while the key is still locked.
    fn upsert_then(&self, key: &str, value: Value, on_commit: &dyn Fn());

    /// Insert a new key. Fails with `AlreadyExists` if the key is present.
    fn add(&self, key: &str, value: Value) -> Result<()> {
        self.add_then(key, value, &|| {})
    }

    /// Replace the value of an existing key. Fails with `NotFound` otherwise.
    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_then(key, value, &|| {})
    }

    /// Insert or replace without any presence requirement.
    fn upsert(&self, key: &str, value: Value) {
        self.upsert_then(key, value, &|| {})
    }

    /// Fetch a copy of the entry for `key`.
    fn get(&self, key: &str) -> Result<Entry>;

    /// Delete `key`, returning the removed entry.
    fn remove(&self, key: &str) -> Result<Entry>;

    /// Delete `key` only if `predicate` holds for its entry while the key is
    /// locked.
    fn remove_if(&self, key: &str, predicate: &dyn Fn(&Entry) -> bool) -> Option<Entry>;

    fn contains(&self, key: &str) -> bool;

    /// All keys, in no particular order.
    fn keys(&self) -> Vec<String>;

    /// All entries, in no particular order.
    fn entries(&self) -> Vec<(String, Entry)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);

    /// Value for `key`, or `default` if the key is absent.
    fn get_or_default(&self, key: &str, default: Value) -> Value {
        self.get(key).map(|entry| entry.value).unwrap_or(default)
    }
}

/// Default [`ValueStore`]: a `DashMap` keyed by string.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValueStore for MemoryStore {
    fn add_then(&self, key: &str, value: Value, on_commit: &dyn Fn()) -> Result<()> {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Err(RegisterError::AlreadyExists(key.to_string())),
            MapEntry::Vacant(slot) => {
                let _guard = slot.insert(Entry::new(value));
                on_commit();
                Ok(())
            }
        }
    }

    fn set_then(&self, key: &str, value: Value, on_commit: &dyn Fn()) -> Result<()> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                *entry = Entry::new(value);
                on_commit();
                Ok(())
            }
            None => Err(RegisterError::NotFound(key.to_string())),
        }
    }

    fn upsert_then(&self, key: &str, value: Value, on_commit: &dyn Fn()) {
        let _guard = self
            .entries
            .entry(key.to_string())
            .insert(Entry::new(value));
        on_commit();
    }

    fn get(&self, key: &str) -> Result<Entry> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegisterError::NotFound(key.to_string()))
    }

    fn remove(&self, key: &str) -> Result<Entry> {
        self.entries
            .remove(key)
            .map(|(_, entry)| entry)
            .ok_or_else(|| RegisterError::NotFound(key.to_string()))
    }

    fn remove_if(&self, key: &str, predicate: &dyn Fn(&Entry) -> bool) -> Option<Entry> {
        self.entries
            .remove_if(key, |_, entry| predicate(entry))
            .map(|(_, entry)| entry)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    fn entries(&self) -> Vec<(String, Entry)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) {
        self.entries.clear();
    }
}
