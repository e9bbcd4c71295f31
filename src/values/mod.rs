//! Concurrent key to value storage.
//!
//! Every operation is atomic for its key; there is no multi-key atomicity.
//! Unrelated keys never contend on a shared lock.

mod store;

pub use store::{MemoryStore, ValueStore};
