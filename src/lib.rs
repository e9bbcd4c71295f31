//! # Switchboard
//!
//! An in-process, thread-safe key-value register. Components publish named
//! values, read them back with a declared type, and subscribe to changes.
//!
//! ## Core Concepts
//!
//! - **Values**: JSON-shaped values per key; typed reads fail with
//!   `TypeMismatch` instead of casting blindly
//! - **Expiration**: optional per-key TTL, evicted lazily by the next read
//! - **Callbacks**: ordered handlers per key, invoked on every Set
//! - **Dispatch**: serial, concurrent, or hybrid fan-out to handlers
//!
//! ## Example
//!
//! ```ignore
//! use switchboard::{callback, DispatchStrategy, Register};
//!
//! let register = Register::new();
//! register.add("a", 5)?;
//!
//! register.register("a", callback(|value| {
//!     println!("a is now {}", value);
//!     Ok(())
//! }));
//!
//! register.set_with("a", 15, None, DispatchStrategy::Concurrent)?;
//! assert_eq!(register.get::<i32>("a")?, 15);
//! ```

pub mod callbacks;
pub mod error;
pub mod expiration;
pub mod register;
pub mod snapshot;
pub mod types;
pub mod values;

// Re-exports
pub use callbacks::{
    callback, Callback, CallbackRegistry, ChangeEvent, DispatchPolicy, DispatchSummary,
    SubscriptionHandle, UpdateRate,
};
pub use error::{HandlerError, HandlerResult, RegisterError, Result};
pub use expiration::ExpirationTracker;
pub use register::{Register, RegisterConfig};
pub use snapshot::{Snapshot, SnapshotFormat};
pub use types::*;
pub use values::{MemoryStore, ValueStore};
