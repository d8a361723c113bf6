//! Subscriber Registry and Broadcast Channel
//!
//! Distributes price samples to everyone listening.
//!
//! # Architecture
//!
//! Two delivery paths share one registry:
//! - **Callbacks**: synchronous observers invoked in subscription order on
//!   the ticking thread. A panic in one callback is caught and logged;
//!   later callbacks still run.
//! - **Channel**: a tokio broadcast channel for async consumers that would
//!   rather `recv().await` than register a callback.
//!
//! Fan-out iterates over a snapshot of the registry taken per sample, and
//! the registry lock is never held while a callback runs. Callbacks may
//! therefore subscribe or unsubscribe (themselves included) freely.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::BroadcastSettings;
use crate::domain::pricing::PriceSample;
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a registered callback.
pub type SubscriberId = u64;

/// Callback invoked with every sample fanned out.
pub type PriceCallback = dyn Fn(&PriceSample) + Send + Sync;

/// Configuration for the broadcast channel.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Capacity of the sample broadcast channel.
    pub channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

impl From<BroadcastSettings> for BroadcastConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            channel_capacity: settings.channel_capacity,
        }
    }
}

struct SubscriberEntry {
    id: SubscriberId,
    active: AtomicBool,
    callback: Box<PriceCallback>,
}

/// Outcome of fanning out one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Callbacks that returned normally.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub panicked: usize,
    /// Channel receivers the sample was queued for.
    pub channel_receivers: usize,
}

// =============================================================================
// Subscriber Registry
// =============================================================================

/// Ordered registry of price callbacks plus a broadcast channel.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use chrono::Utc;
/// use realtime_prices::domain::pricing::PriceSample;
/// use realtime_prices::infrastructure::broadcast::{BroadcastConfig, SubscriberRegistry};
///
/// let registry = Arc::new(SubscriberRegistry::new(BroadcastConfig::default()));
/// let seen = Arc::new(AtomicUsize::new(0));
///
/// let counter = Arc::clone(&seen);
/// let subscription = registry.subscribe(move |_sample| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// let sample = PriceSample {
///     mint: "mint-A".to_string(),
///     price: 42.0,
///     currency: "SOL".to_string(),
///     timestamp: Utc::now(),
///     change_pct: 1.5,
///     volume: 10.0,
/// };
///
/// registry.fan_out(&sample);
/// subscription.unsubscribe();
/// registry.fan_out(&sample);
///
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
pub struct SubscriberRegistry {
    entries: RwLock<Vec<Arc<SubscriberEntry>>>,
    next_id: AtomicU64,
    channel_tx: RwLock<Option<broadcast::Sender<PriceSample>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.subscriber_count())
            .field("receivers", &self.receiver_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SubscriberRegistry {
    /// Create a new registry with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        let (channel_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            channel_tx: RwLock::new(Some(channel_tx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a callback.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// unsubscribed or dropped. On a closed registry the callback is
    /// discarded and an inactive subscription is returned.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&PriceSample) + Send + Sync + 'static,
    {
        if self.is_closed() {
            tracing::debug!("Subscribe on closed registry ignored");
            return Subscription::inactive();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(SubscriberEntry {
            id,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });

        let count = {
            let mut entries = self.entries.write();
            // close() may have drained the registry since the check above
            if self.is_closed() {
                return Subscription::inactive();
            }
            entries.push(entry);
            entries.len()
        };
        metrics::set_subscribers(count);
        tracing::debug!(subscriber_id = id, subscribers = count, "Subscriber added");

        Subscription {
            id: Some(id),
            registry: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// Get a new receiver on the broadcast channel.
    ///
    /// On a closed registry the receiver reports the channel as closed.
    #[must_use]
    pub fn receiver(&self) -> broadcast::Receiver<PriceSample> {
        self.channel_tx.read().as_ref().map_or_else(
            || broadcast::channel(1).1,
            broadcast::Sender::subscribe,
        )
    }

    /// Deliver one sample to every active callback and channel receiver.
    pub fn fan_out(&self, sample: &PriceSample) -> FanOutReport {
        let snapshot: Vec<Arc<SubscriberEntry>> = self.entries.read().clone();
        let mut report = FanOutReport::default();

        for entry in snapshot {
            // Unsubscribed after the snapshot was taken
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| (entry.callback)(sample))) {
                Ok(()) => report.delivered += 1,
                Err(payload) => {
                    report.panicked += 1;
                    tracing::warn!(
                        subscriber_id = entry.id,
                        mint = %sample.mint,
                        panic = panic_message(payload.as_ref()),
                        "Price subscriber panicked, continuing fan-out"
                    );
                }
            }
        }

        if let Some(tx) = self.channel_tx.read().as_ref() {
            match tx.send(sample.clone()) {
                Ok(receivers) => report.channel_receivers = receivers,
                Err(_) => metrics::record_unobserved_sample(),
            }
        }

        metrics::record_deliveries(report.delivered as u64);
        if report.panicked > 0 {
            metrics::record_callback_panics(report.panicked as u64);
        }

        report
    }

    /// Close the registry.
    ///
    /// Drops every callback, closes the broadcast channel and makes future
    /// subscriptions no-ops. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<_> = std::mem::take(&mut *self.entries.write());
        for entry in &drained {
            entry.active.store(false, Ordering::SeqCst);
        }
        self.channel_tx.write().take();

        metrics::set_subscribers(0);
        tracing::debug!(dropped = drained.len(), "Subscriber registry closed");
    }

    /// Whether the registry has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Number of live broadcast receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.channel_tx
            .read()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Remove a callback. Returns true if it was registered.
    fn remove(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut entries = self.entries.write();
            let Some(pos) = entries.iter().position(|e| e.id == id) else {
                return false;
            };
            let entry = entries.remove(pos);
            entry.active.store(false, Ordering::SeqCst);
            (entry, entries.len())
        };

        metrics::set_subscribers(count);
        tracing::debug!(subscriber_id = removed.id, subscribers = count, "Subscriber removed");
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle to a registered callback.
///
/// Unsubscribes on drop. Holds only a weak reference to the registry, so it
/// is safe to keep around after the registry is gone.
#[derive(Debug)]
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    id: Option<SubscriberId>,
    registry: Weak<SubscriberRegistry>,
    active: AtomicBool,
}

impl Subscription {
    /// A subscription that was never registered.
    fn inactive() -> Self {
        Self {
            id: None,
            registry: Weak::new(),
            active: AtomicBool::new(false),
        }
    }

    /// Remove the callback from the registry.
    ///
    /// Returns true on the call that actually removed it; later calls are
    /// no-ops.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }

        match (self.id, self.registry.upgrade()) {
            (Some(id), Some(registry)) => registry.remove(id),
            _ => false,
        }
    }

    /// Whether the callback is still registered.
    ///
    /// False once unsubscribed, or once the registry is closed or dropped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && self
                .registry
                .upgrade()
                .is_some_and(|registry| !registry.is_closed())
    }

    /// Identifier of the callback, if it was ever registered.
    #[must_use]
    pub const fn id(&self) -> Option<SubscriberId> {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;

    fn make_sample(mint: &str) -> PriceSample {
        PriceSample {
            mint: mint.to_string(),
            price: 25.0,
            currency: "SOL".to_string(),
            timestamp: Utc::now(),
            change_pct: -1.2,
            volume: 321.0,
        }
    }

    fn registry() -> Arc<SubscriberRegistry> {
        Arc::new(SubscriberRegistry::new(BroadcastConfig::default()))
    }

    #[test]
    fn registry_creation() {
        let registry = registry();
        assert_eq!(registry.subscriber_count(), 0);
        assert_eq!(registry.receiver_count(), 0);
        assert!(!registry.is_closed());
    }

    #[test]
    fn fan_out_preserves_subscription_order() {
        let registry = registry();
        let order = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<_> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                registry.subscribe(move |_| order.lock().push(i))
            })
            .collect();

        let report = registry.fan_out(&make_sample("mint-A"));

        assert_eq!(report.delivered, 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = registry();
        let sub = registry.subscribe(|_| {});

        assert!(sub.is_active());
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_only_that_callback() {
        let registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = Arc::clone(&hits);
        let first = registry.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = Arc::clone(&hits);
        let _second = registry.subscribe(move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
        });

        first.unsubscribe();
        registry.fan_out(&make_sample("mint-A"));

        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn drop_unsubscribes() {
        let registry = registry();
        {
            let _sub = registry.subscribe(|_| {});
            assert_eq!(registry.subscriber_count(), 1);
        }
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn panicking_callback_does_not_stop_fan_out() {
        let registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = registry.subscribe(|_| panic!("subscriber failure"));
        let h = Arc::clone(&hits);
        let _good = registry.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let report = registry.fan_out(&make_sample("mint-A"));

        assert_eq!(report.panicked, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Registry still usable afterwards
        registry.fan_out(&make_sample("mint-A"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_unsubscribing_later_callback_mid_fan_out() {
        let registry = registry();
        let later_hits = Arc::new(AtomicUsize::new(0));
        let later_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&later_slot);
        let _first = registry.subscribe(move |_| {
            if let Some(sub) = slot.lock().as_ref() {
                sub.unsubscribe();
            }
        });

        let h = Arc::clone(&later_hits);
        let later = registry.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        *later_slot.lock() = Some(later);

        registry.fan_out(&make_sample("mint-A"));

        // Removed before its turn, so it never ran
        assert_eq!(later_hits.load(Ordering::SeqCst), 0);
        assert_eq!(registry.subscriber_count(), 1);
    }

    #[test]
    fn callback_subscribing_during_fan_out_waits_for_next_sample() {
        let registry = registry();
        let added: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let inner_hits = Arc::new(AtomicUsize::new(0));

        let reg = Arc::clone(&registry);
        let added_clone = Arc::clone(&added);
        let hits = Arc::clone(&inner_hits);
        let _outer = registry.subscribe(move |_| {
            let mut added = added_clone.lock();
            if added.is_empty() {
                let hits = Arc::clone(&hits);
                added.push(reg.subscribe(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }));
            }
        });

        registry.fan_out(&make_sample("mint-A"));
        assert_eq!(inner_hits.load(Ordering::SeqCst), 0);

        registry.fan_out(&make_sample("mint-A"));
        assert_eq!(inner_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_receivers_get_samples() {
        let registry = registry();
        let mut rx1 = registry.receiver();
        let mut rx2 = registry.receiver();

        let report = registry.fan_out(&make_sample("mint-A"));
        assert_eq!(report.channel_receivers, 2);

        assert_eq!(rx1.recv().await.unwrap().mint, "mint-A");
        assert_eq!(rx2.recv().await.unwrap().mint, "mint-A");
    }

    #[test]
    fn fan_out_without_receivers_is_fine() {
        let registry = registry();
        let report = registry.fan_out(&make_sample("mint-A"));
        assert_eq!(report, FanOutReport::default());
    }

    #[tokio::test]
    async fn close_drops_callbacks_and_channel() {
        let registry = registry();
        let sub = registry.subscribe(|_| {});
        let mut rx = registry.receiver();
        assert!(sub.is_active());

        registry.close();
        registry.close();

        assert!(registry.is_closed());
        assert_eq!(registry.subscriber_count(), 0);
        assert!(!sub.is_active());
        assert!(!sub.unsubscribe());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn subscribe_after_close_is_inert() {
        let registry = registry();
        registry.close();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = registry.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!sub.is_active());
        assert_eq!(sub.id(), None);
        registry.fan_out(&make_sample("mint-A"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let mut rx = registry.receiver();
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn close_racing_subscribe_leaves_registry_empty() {
        use std::thread;

        for _ in 0..50 {
            let registry = registry();
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    thread::spawn(move || {
                        (0..50)
                            .map(|_| registry.subscribe(|_| {}))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            registry.close();
            let subs: Vec<Subscription> = handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect();

            assert_eq!(registry.subscriber_count(), 0);
            assert!(subs.iter().all(|sub| !sub.is_active()));
        }
    }

    #[test]
    fn subscription_outlives_registry() {
        let registry = registry();
        let sub = registry.subscribe(|_| {});
        drop(registry);

        assert!(!sub.is_active());
        assert!(!sub.unsubscribe());
    }
}
