//! Price Watch
//!
//! Per-consumer view over the price service: the latest sample for each
//! mint a consumer cares about.
//!
//! Attaching a watch tracks its mints on behalf of that consumer and
//! registers a filtering callback. Detaching (explicitly or by drop) undoes
//! both, and is safe after the service has been destroyed or dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::watch;

use super::price_service::PriceService;
use crate::domain::pricing::{Mint, PriceSample};
use crate::domain::tracking::ConsumerId;
use crate::infrastructure::broadcast::Subscription;

/// State shared between a watch and its callback.
#[derive(Debug, Default)]
struct WatchView {
    mints: RwLock<BTreeSet<Mint>>,
    prices: RwLock<HashMap<Mint, PriceSample>>,
}

impl WatchView {
    /// Store a sample if the mint is watched. Returns true if stored.
    fn apply(&self, sample: &PriceSample) -> bool {
        if !self.mints.read().contains(&sample.mint) {
            return false;
        }

        self.prices
            .write()
            .insert(sample.mint.clone(), sample.clone());
        true
    }
}

/// Latest prices for a consumer's mints.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use realtime_prices::{PriceService, SimulatorConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = SimulatorConfig::default().with_tick_interval(Duration::from_secs(60));
/// let service = PriceService::start(&config).unwrap();
///
/// let watch = service.watch(["mint-A"]);
/// assert!(watch.price("mint-A").is_none());
///
/// service.tick();
/// assert!(watch.price("mint-A").is_some());
///
/// watch.detach();
/// assert!(!service.is_tracked("mint-A"));
/// # }
/// ```
#[derive(Debug)]
pub struct PriceWatch {
    consumer: ConsumerId,
    service: Weak<PriceService>,
    view: Arc<WatchView>,
    updates: watch::Receiver<u64>,
    subscription: Subscription,
    primary: Option<Mint>,
    detached: AtomicBool,
}

impl PriceWatch {
    /// Attach a watch for `mints` to `service`.
    pub fn attach<I>(service: &Arc<PriceService>, mints: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Mint>,
    {
        let mints: BTreeSet<Mint> = mints.into_iter().map(Into::into).collect();
        Self::attach_set(service, mints, None)
    }

    /// Attach a watch for a single mint.
    ///
    /// [`PriceWatch::current`] then returns that mint's latest sample.
    pub fn single(service: &Arc<PriceService>, mint: impl Into<Mint>) -> Self {
        let mint = mint.into();
        let mints = BTreeSet::from([mint.clone()]);
        Self::attach_set(service, mints, Some(mint))
    }

    fn attach_set(
        service: &Arc<PriceService>,
        mints: BTreeSet<Mint>,
        primary: Option<Mint>,
    ) -> Self {
        let consumer = service.allocate_consumer();
        let initial: Vec<Mint> = mints.iter().cloned().collect();

        let view = Arc::new(WatchView {
            mints: RwLock::new(mints),
            prices: RwLock::new(HashMap::new()),
        });

        // The sender lives in the callback: once the callback is dropped
        // (detach or service teardown) pending `changed()` calls resolve.
        let (updates_tx, updates) = watch::channel(0_u64);
        let callback_view = Arc::clone(&view);
        let subscription = service.subscribe(move |sample| {
            if callback_view.apply(sample) {
                updates_tx.send_modify(|count| *count = count.wrapping_add(1));
            }
        });

        service.track_for(consumer, &initial);
        tracing::debug!(consumer, mints = initial.len(), "Price watch attached");

        Self {
            consumer,
            service: Arc::downgrade(service),
            view,
            updates,
            subscription,
            primary,
            detached: AtomicBool::new(false),
        }
    }

    /// Consumer identifier used for tracking.
    #[must_use]
    pub const fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }

    /// Latest sample seen for a mint, or `None` if none arrived yet.
    #[must_use]
    pub fn price(&self, mint: &str) -> Option<PriceSample> {
        self.view.prices.read().get(mint).cloned()
    }

    /// Latest sample for the mint given to [`PriceWatch::single`].
    #[must_use]
    pub fn current(&self) -> Option<PriceSample> {
        self.primary.as_deref().and_then(|mint| self.price(mint))
    }

    /// Copy of every latest sample this watch holds.
    #[must_use]
    pub fn prices(&self) -> HashMap<Mint, PriceSample> {
        self.view.prices.read().clone()
    }

    /// Mints this watch follows, in sorted order.
    #[must_use]
    pub fn mints(&self) -> Vec<Mint> {
        self.view.mints.read().iter().cloned().collect()
    }

    /// Start following another mint. No-op once detached.
    pub fn track(&self, mint: impl Into<Mint>) {
        if self.is_detached() {
            return;
        }

        let mint = mint.into();
        if !self.view.mints.write().insert(mint.clone()) {
            return;
        }

        if let Some(service) = self.service.upgrade() {
            service.track_for(self.consumer, &[mint]);
        }
    }

    /// Stop following a mint and forget its latest sample.
    pub fn untrack(&self, mint: &str) {
        if self.is_detached() {
            return;
        }

        if !self.view.mints.write().remove(mint) {
            return;
        }
        self.view.prices.write().remove(mint);

        if let Some(service) = self.service.upgrade() {
            service.untrack_for(self.consumer, &[mint.to_string()]);
        }
    }

    /// Whether the watch is attached to a running service.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.is_detached()
            && self
                .service
                .upgrade()
                .is_some_and(|service| service.is_running())
    }

    /// Wait for the next update to one of this watch's mints.
    ///
    /// Returns `false` instead of waiting forever once the watch is
    /// detached or its service is gone.
    pub async fn changed(&self) -> bool {
        if !self.is_connected() {
            return false;
        }

        let mut updates = self.updates.clone();
        updates.mark_unchanged();
        updates.changed().await.is_ok()
    }

    /// Detach from the service.
    ///
    /// Unsubscribes, releases this consumer's mints and discards the
    /// latest-value map. Idempotent, and a no-op against a destroyed or
    /// dropped service.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }

        self.subscription.unsubscribe();
        if let Some(service) = self.service.upgrade() {
            service.release_consumer(self.consumer);
        }
        self.view.prices.write().clear();

        tracing::debug!(consumer = self.consumer, "Price watch detached");
    }

    /// Whether [`PriceWatch::detach`] has run.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

impl Drop for PriceWatch {
    fn drop(&mut self) {
        self.detach();
    }
}

// =============================================================================
// Tests
// =============================================================================
