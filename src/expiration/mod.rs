//! Per-key expiry instants with lazy checking.
//!
//! Records are weak: a record may exist for an absent key, and a present
//! key without a record never expires. Nothing here evicts values; the
//! register does that when a read observes an expired key.

mod tracker;

pub use tracker::ExpirationTracker;
