//! Subscription types for change notifications.

use crate::error::HandlerResult;
use crate::types::{SubscriptionId, Timestamp};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// A change handler. Invoked with the new value each time its key is set.
///
/// Handlers are compared by pointer: cloning the `Arc` yields the "same"
/// handler for [`CallbackRegistry::remove_one`](super::CallbackRegistry::remove_one).
pub type Callback = Arc<dyn Fn(&Value) -> HandlerResult + Send + Sync>;

/// Wrap a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Pointer identity for handlers, ignoring vtable differences.
pub(crate) fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Event delivered to channel subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Value,
    /// When the dispatch carrying this event started.
    pub timestamp: Timestamp,
}

/// What a subscription invokes.
#[derive(Clone)]
pub(crate) enum Subscriber {
    /// Caller-supplied handler; runs to completion inside the dispatch.
    Handler(Callback),
    /// Bounded channel; delivery completes as soon as the event is queued.
    Channel(Sender<ChangeEvent>),
}

/// Internal subscription state.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub subscriber: Subscriber,
}

impl Subscription {
    pub fn is_handler(&self, handler: &Callback) -> bool {
        match &self.subscriber {
            Subscriber::Handler(h) => same_callback(h, handler),
            Subscriber::Channel(_) => false,
        }
    }
}

/// Thresholds and limits applied when dispatching.
#[derive(Clone, Debug)]
pub struct DispatchPolicy {
    /// Hybrid stays serial while a key has fewer subscribers than this.
    pub callback_count_threshold: usize,
    /// Hybrid stays serial while the update rate is below this.
    pub update_rate_threshold: u64,
    /// Deadline for concurrent dispatch (None = wait for every handler).
    pub handler_timeout: Option<Duration>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            callback_count_threshold: 10,
            update_rate_threshold: 100,
            handler_timeout: None,
        }
    }
}

/// Handle to a channel subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub key: String,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<ChangeEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ChangeEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ChangeEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ChangeEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
