//! Change subscriptions and their dispatch.
//!
//! Subscribers are kept per key in registration order. A dispatch invokes
//! a copy of the key's list using one of three strategies:
//! - `Serial`: one handler at a time, in registration order
//! - `Concurrent`: every handler on its own thread, joined before returning
//! - `Hybrid`: serial until the subscriber count or the update rate reaches
//!   its threshold, concurrent beyond
//!
//! Every handler is attempted even when an earlier one fails; the first
//! failure is reported afterwards.
//!
//! # Example
//!
//! ```ignore
//! let registry = CallbackRegistry::new();
//! registry.register("temperature", callback(|value| {
//!     println!("now {}", value);
//!     Ok(())
//! }));
//! registry.dispatch("temperature", &json!(21.5), DispatchStrategy::Serial, 0)?;
//! ```

mod rate;
mod registry;
mod types;

pub use rate::UpdateRate;
pub use registry::{CallbackRegistry, DispatchSummary};
pub use types::{callback, Callback, ChangeEvent, DispatchPolicy, SubscriptionHandle};
