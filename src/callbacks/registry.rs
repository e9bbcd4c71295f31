//! Callback registry and dispatch strategies.

use crate::error::{RegisterError, Result};
use crate::types::{DispatchStrategy, SubscriptionId, Timestamp};
use crossbeam_channel::{bounded, RecvTimeoutError, TrySendError};
use dashmap::DashMap;
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::types::{
    Callback, ChangeEvent, DispatchPolicy, Subscriber, Subscription, SubscriptionHandle,
};

/// Result of a completed dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Strategy actually used (never `Hybrid`).
    pub strategy: DispatchStrategy,
    /// Subscriptions invoked.
    pub invoked: usize,
}

/// How a single subscription took its event.
enum Outcome {
    Delivered,
    Failed(String),
    /// Channel receiver is gone; the subscription is pruned.
    Disconnected,
}

/// Per-key ordered lists of change subscribers.
///
/// List mutation happens under the map's shard lock for the key. Dispatch
/// copies the list first and invokes handlers with no lock held, so
/// handlers may register or remove subscriptions freely.
pub struct CallbackRegistry {
    lists: DashMap<String, Vec<Subscription>>,
    next_id: AtomicU64,
    policy: DispatchPolicy,
}

impl CallbackRegistry {
    /// Create a registry with the default dispatch policy.
    pub fn new() -> Self {
        Self::with_policy(DispatchPolicy::default())
    }

    pub fn with_policy(policy: DispatchPolicy) -> Self {
        Self {
            lists: DashMap::new(),
            next_id: AtomicU64::new(1),
            policy,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Append `handler` to the subscribers of `key`.
    ///
    /// Registering the same handler twice yields two independent
    /// invocations per dispatch.
    pub fn register(&self, key: &str, handler: Callback) -> SubscriptionId {
        self.push(key, Subscriber::Handler(handler))
    }

    /// Subscribe a bounded channel to `key`.
    ///
    /// A full buffer fails the dispatch that overflowed it; a dropped
    /// receiver silently removes the subscription on the next dispatch.
    pub fn subscribe(&self, key: &str, buffer_size: usize) -> SubscriptionHandle {
        let (sender, receiver) = bounded(buffer_size.max(1));
        let id = self.push(key, Subscriber::Channel(sender));
        SubscriptionHandle {
            id,
            key: key.to_string(),
            receiver,
        }
    }

    fn push(&self, key: &str, subscriber: Subscriber) -> SubscriptionId {
        let mut list = self.lists.entry(key.to_string()).or_default();
        // Allocated under the key's lock so list order matches id order.
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        list.push(Subscription { id, subscriber });
        trace!(key, %id, "subscription registered");
        id
    }

    /// Remove the first subscription of `key` using `handler`.
    pub fn remove_one(&self, key: &str, handler: &Callback) -> bool {
        let Some(mut list) = self.lists.get_mut(key) else {
            return false;
        };
        match list.iter().position(|s| s.is_handler(handler)) {
            Some(pos) => {
                let removed = list.remove(pos);
                trace!(key, id = %removed.id, "subscription removed");
                true
            }
            None => false,
        }
    }

    /// Remove the subscription with `id` from `key`.
    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        let Some(mut list) = self.lists.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        before != list.len()
    }

    /// Drop every subscription of `key`. The key stays registrable.
    pub fn remove_all(&self, key: &str) -> usize {
        match self.lists.get_mut(key) {
            Some(mut list) => {
                let removed = list.len();
                list.clear();
                trace!(key, removed, "subscriptions cleared");
                removed
            }
            None => 0,
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.lists.get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// Total subscriptions across all keys.
    pub fn subscription_count(&self) -> usize {
        self.lists.iter().map(|l| l.len()).sum()
    }

    /// Drop every subscription for every key.
    pub fn clear(&self) {
        self.lists.clear();
    }

    /// Pick Serial or Concurrent for a dispatch.
    pub fn resolve(
        &self,
        strategy: DispatchStrategy,
        subscriber_count: usize,
        update_rate: u64,
    ) -> DispatchStrategy {
        match strategy {
            DispatchStrategy::Hybrid => {
                if subscriber_count < self.policy.callback_count_threshold
                    && update_rate < self.policy.update_rate_threshold
                {
                    DispatchStrategy::Serial
                } else {
                    DispatchStrategy::Concurrent
                }
            }
            other => other,
        }
    }

    /// Invoke every current subscriber of `key` with `value`.
    ///
    /// All subscribers are attempted before returning. If any failed, the
    /// earliest-registered failure is returned as `HandlerFailure`.
    pub fn dispatch(
        &self,
        key: &str,
        value: &Value,
        strategy: DispatchStrategy,
        update_rate: u64,
    ) -> Result<DispatchSummary> {
        let subs = self.snapshot(key);
        let strategy = self.resolve(strategy, subs.len(), update_rate);

        if subs.is_empty() {
            return Ok(DispatchSummary {
                strategy,
                invoked: 0,
            });
        }
        debug!(key, ?strategy, subscribers = subs.len(), update_rate, "dispatching change");

        let event = ChangeEvent {
            key: key.to_string(),
            value: value.clone(),
            timestamp: Timestamp::now(),
        };
        let outcomes = match strategy {
            DispatchStrategy::Serial => run_serial(&event, &subs),
            _ => self.run_concurrent(Arc::new(event), subs),
        };

        self.settle(key, strategy, outcomes)
    }

    fn snapshot(&self, key: &str) -> Vec<Subscription> {
        self.lists.get(key).map(|l| l.value().clone()).unwrap_or_default()
    }

    fn run_concurrent(
        &self,
        event: Arc<ChangeEvent>,
        subs: Vec<Subscription>,
    ) -> Vec<(SubscriptionId, Outcome)> {
        let (tx, rx) = bounded(subs.len());
        let mut outcomes = Vec::with_capacity(subs.len());
        let mut running = Vec::new();

        for sub in subs {
            let id = sub.id;
            if matches!(sub.subscriber, Subscriber::Channel(_)) {
                // Channel delivery never blocks.
                outcomes.push((id, invoke(&sub, &event)));
                continue;
            }

            let tx = tx.clone();
            let event = Arc::clone(&event);
            let spawned = thread::Builder::new()
                .name(format!("switchboard-dispatch-{}", id.0))
                .spawn(move || {
                    let outcome = invoke(&sub, &event);
                    let _ = tx.send((sub.id, outcome));
                });
            match spawned {
                Ok(_) => running.push(id),
                Err(e) => outcomes.push((id, Outcome::Failed(format!("spawn failed: {}", e)))),
            }
        }
        drop(tx);

        let deadline = self.policy.handler_timeout.map(|t| Instant::now() + t);
        let mut finished = HashSet::with_capacity(running.len());
        while finished.len() < running.len() {
            let received = match deadline {
                Some(deadline) => rx.recv_deadline(deadline),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((id, outcome)) => {
                    finished.insert(id);
                    outcomes.push((id, outcome));
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for id in running.into_iter().filter(|id| !finished.contains(id)) {
            let reason = match self.policy.handler_timeout {
                Some(timeout) => format!("timed out after {:?}", timeout),
                None => "handler thread exited without reporting".to_string(),
            };
            outcomes.push((id, Outcome::Failed(reason)));
        }

        outcomes.sort_by_key(|(id, _)| *id);
        outcomes
    }

    fn settle(
        &self,
        key: &str,
        strategy: DispatchStrategy,
        outcomes: Vec<(SubscriptionId, Outcome)>,
    ) -> Result<DispatchSummary> {
        let invoked = outcomes.len();
        let mut first_failure = None;
        let mut disconnected = Vec::new();

        for (id, outcome) in outcomes {
            match outcome {
                Outcome::Delivered => {}
                Outcome::Disconnected => disconnected.push(id),
                Outcome::Failed(reason) => {
                    warn!(key, %id, %reason, "change handler failed");
                    if first_failure.is_none() {
                        first_failure = Some((id, reason));
                    }
                }
            }
        }

        if !disconnected.is_empty() {
            if let Some(mut list) = self.lists.get_mut(key) {
                list.retain(|s| !disconnected.contains(&s.id));
            }
            debug!(key, pruned = disconnected.len(), "pruned disconnected subscribers");
        }

        match first_failure {
            Some((subscription, reason)) => Err(RegisterError::HandlerFailure {
                key: key.to_string(),
                subscription,
                reason,
            }),
            None => Ok(DispatchSummary { strategy, invoked }),
        }
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn run_serial(event: &ChangeEvent, subs: &[Subscription]) -> Vec<(SubscriptionId, Outcome)> {
    subs.iter().map(|sub| (sub.id, invoke(sub, event))).collect()
}

fn invoke(sub: &Subscription, event: &ChangeEvent) -> Outcome {
    match &sub.subscriber {
        Subscriber::Handler(handler) => {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event.value))) {
                Ok(Ok(())) => Outcome::Delivered,
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(payload) => Outcome::Failed(format!("panicked: {}", panic_message(&*payload))),
            }
        }
        Subscriber::Channel(sender) => match sender.try_send(event.clone()) {
            Ok(()) => Outcome::Delivered,
            Err(TrySendError::Full(_)) => Outcome::Failed("subscriber buffer full".to_string()),
            Err(TrySendError::Disconnected(_)) => Outcome::Disconnected,
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::callback;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Callback {
        let log = Arc::clone(log);
        let name = name.to_string();
        callback(move |value| {
            log.lock().push(format!("{}={}", name, value));
            Ok(())
        })
    }

    #[test]
    fn test_serial_preserves_registration_order() {
        let registry = CallbackRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            registry.register("k", recorder(&log, name));
        }

        let summary = registry
            .dispatch("k", &json!(2), DispatchStrategy::Serial, 0)
            .unwrap();

        assert_eq!(summary.strategy, DispatchStrategy::Serial);
        assert_eq!(summary.invoked, 3);
        assert_eq!(*log.lock(), vec!["first=2", "second=2", "third=2"]);
    }

    #[test]
    fn test_duplicate_registration_invoked_twice() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.register("k", Arc::clone(&handler));
        registry.register("k", Arc::clone(&handler));
        registry.dispatch("k", &json!(1), DispatchStrategy::Serial, 0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Only the first occurrence goes.
        assert!(registry.remove_one("k", &handler));
        assert_eq!(registry.subscriber_count("k"), 1);
        registry.dispatch("k", &json!(1), DispatchStrategy::Serial, 0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_remove_one_absent_is_noop() {
        let registry = CallbackRegistry::new();
        let handler = callback(|_| Ok(()));
        let other = callback(|_| Ok(()));

        assert!(!registry.remove_one("nobody", &handler));
        registry.register("k", other);
        assert!(!registry.remove_one("k", &handler));
        assert_eq!(registry.subscriber_count("k"), 1);
    }

    #[test]
    fn test_remove_all_then_reregister() {
        let registry = CallbackRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("k", recorder(&log, "a"));
        registry.register("k", recorder(&log, "b"));

        assert_eq!(registry.remove_all("k"), 2);
        registry.dispatch("k", &json!(3), DispatchStrategy::Serial, 0).unwrap();
        assert!(log.lock().is_empty());

        registry.register("k", recorder(&log, "c"));
        registry.dispatch("k", &json!(4), DispatchStrategy::Serial, 0).unwrap();
        assert_eq!(*log.lock(), vec!["c=4"]);
    }

    #[test]
    fn test_serial_runs_all_then_reports_first_failure() {
        let registry = CallbackRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register("k", recorder(&log, "before"));
        let failing = registry.register("k", callback(|_| Err("first boom".into())));
        registry.register("k", callback(|_| Err("second boom".into())));
        registry.register("k", recorder(&log, "after"));

        let result = registry.dispatch("k", &json!(1), DispatchStrategy::Serial, 0);
        match result {
            Err(RegisterError::HandlerFailure {
                subscription,
                reason,
                ..
            }) => {
                assert_eq!(subscription, failing);
                assert_eq!(reason, "first boom");
            }
            other => panic!("Expected HandlerFailure, got {:?}", other),
        }
        assert_eq!(*log.lock(), vec!["before=1", "after=1"]);
    }

    #[test]
    fn test_panicking_handler_is_a_failure() {
        let registry = CallbackRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("k", callback(|_| panic!("handler exploded")));
        registry.register("k", recorder(&log, "survivor"));

        let result = registry.dispatch("k", &json!(1), DispatchStrategy::Serial, 0);
        match result {
            Err(RegisterError::HandlerFailure { reason, .. }) => {
                assert!(reason.contains("handler exploded"));
            }
            other => panic!("Expected HandlerFailure, got {:?}", other),
        }
        assert_eq!(*log.lock(), vec!["survivor=1"]);
    }

    #[test]
    fn test_concurrent_handlers_overlap() {
        let registry = CallbackRegistry::new();
        let n = 4;
        // Every handler waits for all others; only passes if they overlap.
        let barrier = Arc::new(Barrier::new(n));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..n {
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            registry.register(
                "k",
                callback(move |_| {
                    barrier.wait();
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        let summary = registry
            .dispatch("k", &json!(1), DispatchStrategy::Concurrent, 0)
            .unwrap();
        assert_eq!(summary.strategy, DispatchStrategy::Concurrent);
        assert_eq!(summary.invoked, n);
        assert_eq!(done.load(Ordering::SeqCst), n);
    }

    #[test]
    fn test_concurrent_failure_after_all_finish() {
        let registry = CallbackRegistry::new();
        let done = Arc::new(AtomicUsize::new(0));

        registry.register("k", callback(|_| Err("bad".into())));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            registry.register(
                "k",
                callback(move |_| {
                    thread::sleep(Duration::from_millis(20));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        let result = registry.dispatch("k", &json!(1), DispatchStrategy::Concurrent, 0);
        assert!(matches!(result, Err(RegisterError::HandlerFailure { .. })));
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_timeout() {
        let registry = CallbackRegistry::with_policy(DispatchPolicy {
            handler_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        registry.register(
            "k",
            callback(|_| {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            }),
        );

        let started = Instant::now();
        let result = registry.dispatch("k", &json!(1), DispatchStrategy::Concurrent, 0);
        assert!(started.elapsed() < Duration::from_millis(250));
        match result {
            Err(RegisterError::HandlerFailure { reason, .. }) => {
                assert!(reason.contains("timed out"));
            }
            other => panic!("Expected timeout failure, got {:?}", other),
        }
    }

    #[test]
    fn test_hybrid_resolution() {
        let registry = CallbackRegistry::with_policy(DispatchPolicy {
            callback_count_threshold: 3,
            update_rate_threshold: 50,
            handler_timeout: None,
        });

        assert_eq!(
            registry.resolve(DispatchStrategy::Hybrid, 2, 10),
            DispatchStrategy::Serial
        );
        assert_eq!(
            registry.resolve(DispatchStrategy::Hybrid, 3, 10),
            DispatchStrategy::Concurrent
        );
        assert_eq!(
            registry.resolve(DispatchStrategy::Hybrid, 2, 50),
            DispatchStrategy::Concurrent
        );
        assert_eq!(
            registry.resolve(DispatchStrategy::Serial, 100, 1000),
            DispatchStrategy::Serial
        );
    }

    #[test]
    fn test_dispatch_uses_snapshot() {
        let registry = Arc::new(CallbackRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let inner_registry = Arc::clone(&registry);
        let inner_calls = Arc::clone(&calls);
        registry.register(
            "k",
            callback(move |_| {
                let calls = Arc::clone(&inner_calls);
                inner_registry.register(
                    "k",
                    callback(move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                );
                Ok(())
            }),
        );

        registry.dispatch("k", &json!(1), DispatchStrategy::Serial, 0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.subscriber_count("k"), 2);

        registry.dispatch("k", &json!(2), DispatchStrategy::Serial, 0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Break the Arc cycle held by the first handler.
        registry.clear();
    }

    #[test]
    fn test_channel_subscriber_receives_event() {
        let registry = CallbackRegistry::new();
        let handle = registry.subscribe("k", 8);

        registry.dispatch("k", &json!("hello"), DispatchStrategy::Serial, 0).unwrap();

        let event = handle.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(event.key, "k");
        assert_eq!(event.value, json!("hello"));
    }

    #[test]
    fn test_channel_overflow_fails_dispatch() {
        let registry = CallbackRegistry::new();
        let _handle = registry.subscribe("k", 1);

        registry.dispatch("k", &json!(1), DispatchStrategy::Serial, 0).unwrap();
        let result = registry.dispatch("k", &json!(2), DispatchStrategy::Serial, 0);
        assert!(matches!(result, Err(RegisterError::HandlerFailure { .. })));
    }

    #[test]
    fn test_dropped_channel_is_pruned() {
        let registry = CallbackRegistry::new();
        let handle = registry.subscribe("k", 4);
        assert_eq!(registry.subscriber_count("k"), 1);

        drop(handle);
        registry.dispatch("k", &json!(1), DispatchStrategy::Concurrent, 0).unwrap();
        assert_eq!(registry.subscriber_count("k"), 0);
    }

    #[test]
    fn test_unsubscribe_by_id() {
        let registry = CallbackRegistry::new();
        let id = registry.register("k", callback(|_| Ok(())));
        registry.register("k", callback(|_| Ok(())));

        assert!(registry.unsubscribe("k", id));
        assert!(!registry.unsubscribe("k", id));
        assert_eq!(registry.subscription_count(), 1);
    }
}
