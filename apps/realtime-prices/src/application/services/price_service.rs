//! Price Service
//!
//! Owns the tick loop that turns tracked mints into simulated price samples
//! and fans them out to subscribers.
//!
//! # Lifecycle
//!
//! ```text
//! start() ──► Running ──destroy()──► Destroyed
//!               │  every tick_interval:
//!               │    snapshot tracked mints
//!               │    generate one sample per mint
//!               │    fan out each sample
//! ```
//!
//! A destroyed service never ticks again and is never restarted; create a
//! new one instead. Every operation on a destroyed service is a silent
//! no-op, since UI teardown order is not guaranteed.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::price_watch::PriceWatch;
use crate::application::ports::{Clock, SystemClock};
use crate::domain::pricing::{self, Mint, PriceSample};
use crate::domain::tracking::{ConsumerId, TrackedSet, TrackingStats};
use crate::infrastructure::broadcast::{BroadcastConfig, SubscriberRegistry, Subscription};
use crate::infrastructure::metrics;
use crate::SimulatorConfig;

/// Error creating a price service.
#[derive(Debug, thiserror::Error)]
pub enum PriceServiceError {
    /// The tick interval is zero.
    #[error("tick interval must be greater than zero")]
    ZeroInterval,
    /// No Tokio runtime is available to drive the tick loop.
    #[error("price service must be started inside a Tokio runtime")]
    NoRuntime,
}

/// Snapshot of service state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Whether the service is still running.
    pub running: bool,
    /// Tracked mint statistics.
    pub tracking: TrackingStats,
    /// Registered callbacks.
    pub subscribers: usize,
    /// Live broadcast receivers.
    pub receivers: usize,
    /// Ticks that produced samples.
    pub ticks: u64,
}

/// Simulated real-time price service.
///
/// Shared as `Arc<PriceService>`; the tick loop only holds a weak
/// reference, so dropping the last handle also stops the loop.
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
/// let config = SimulatorConfig::default().with_tick_interval(Duration::from_millis(10));
/// let service = PriceService::start(&config).unwrap();
///
/// let subscription = service.subscribe(|sample| {
///     assert_eq!(sample.currency, "SOL");
/// });
/// service.track("mint-A");
///
/// assert_eq!(service.tick(), 1);
/// assert!(service.latest("mint-A").is_some());
///
/// subscription.unsubscribe();
/// service.destroy();
/// assert_eq!(service.tick(), 0);
/// # }
/// ```
pub struct PriceService {
    tick_interval: Duration,
    tracked: TrackedSet,
    subscribers: Arc<SubscriberRegistry>,
    latest: RwLock<HashMap<Mint, PriceSample>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    clock: Arc<dyn Clock>,
    /// Serializes ticks across threads.
    tick_lock: ReentrantMutex<Cell<TickState>>,
    destroyed: AtomicBool,
    cancel: CancellationToken,
    next_consumer: AtomicU64,
    ticks: AtomicU64,
}

impl std::fmt::Debug for PriceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceService")
            .field("tick_interval", &self.tick_interval)
            .field("running", &self.is_running())
            .field("tracked", &self.tracked.len())
            .field("subscribers", &self.subscribers.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl PriceService {
    /// Start a service with an OS-seeded random source and the system clock.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the tick interval is zero or no runtime is
    /// available.
    pub fn start(config: &SimulatorConfig) -> Result<Arc<Self>, PriceServiceError> {
        Self::start_with(
            config,
            Box::new(StdRng::from_os_rng()),
            Arc::new(SystemClock),
        )
    }

    /// Start a service with an injected random source and clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the tick interval is zero or no runtime is
    /// available.
    pub fn start_with(
        config: &SimulatorConfig,
        rng: Box<dyn RngCore + Send>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, PriceServiceError> {
        let tick_interval = config.scheduler.tick_interval;
        if tick_interval.is_zero() {
            return Err(PriceServiceError::ZeroInterval);
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| PriceServiceError::NoRuntime)?;

        let service = Arc::new(Self {
            tick_interval,
            tracked: TrackedSet::new(),
            subscribers: Arc::new(SubscriberRegistry::new(BroadcastConfig::from(
                config.broadcast,
            ))),
            latest: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
            clock,
            tick_lock: ReentrantMutex::new(Cell::new(TickState::default())),
            destroyed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            next_consumer: AtomicU64::new(1),
            ticks: AtomicU64::new(0),
        });

        runtime.spawn(run_ticker(
            Arc::downgrade(&service),
            tick_interval,
            service.cancel.clone(),
        ));

        tracing::info!(
            tick_interval_ms = u64::try_from(tick_interval.as_millis()).unwrap_or(u64::MAX),
            "Price service started"
        );

        Ok(service)
    }

    // =========================================================================
    // Tracking
    // =========================================================================

    /// Track a mint. Idempotent.
    pub fn track(&self, mint: &str) {
        if self.is_destroyed() {
            tracing::debug!(mint, "Track on destroyed price service ignored");
            return;
        }

        if self.tracked.track(mint) {
            tracing::debug!(mint, "Mint tracked");
        }
        metrics::set_tracked_mints(self.tracked.len());
    }

    /// Stop tracking a mint. Idempotent, absent mints are ignored.
    ///
    /// Mints also held by a [`PriceWatch`] stay tracked until the watch
    /// releases them.
    pub fn untrack(&self, mint: &str) {
        if self.is_destroyed() {
            tracing::debug!(mint, "Untrack on destroyed price service ignored");
            return;
        }

        if self.tracked.untrack(mint) {
            self.latest.write().remove(mint);
            tracing::debug!(mint, "Mint untracked");
        }
        metrics::set_tracked_mints(self.tracked.len());
    }

    /// Whether a mint is tracked.
    #[must_use]
    pub fn is_tracked(&self, mint: &str) -> bool {
        self.tracked.contains(mint)
    }

    /// Tracked mints, in sorted order.
    #[must_use]
    pub fn tracked_mints(&self) -> Vec<Mint> {
        self.tracked.snapshot()
    }

    // =========================================================================
    // Subscribers
    // =========================================================================

    /// Register a callback for every sample.
    ///
    /// On a destroyed service the callback is discarded and the returned
    /// subscription is inactive.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PriceSample) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Get a broadcast receiver for every sample.
    ///
    /// The channel closes when the service is destroyed.
    #[must_use]
    pub fn receiver(&self) -> broadcast::Receiver<PriceSample> {
        self.subscribers.receiver()
    }

    /// Create a per-consumer view of the given mints.
    pub fn watch<I>(self: &Arc<Self>, mints: I) -> PriceWatch
    where
        I: IntoIterator,
        I::Item: Into<Mint>,
    {
        PriceWatch::attach(self, mints)
    }

    /// Most recent sample generated for a mint, if any.
    #[must_use]
    pub fn latest(&self, mint: &str) -> Option<PriceSample> {
        self.latest.read().get(mint).cloned()
    }

    // =========================================================================
    // Ticking
    // =========================================================================

    /// Run one tick now.
    ///
    /// Returns the number of samples produced. Zero tracked mints, or a
    /// destroyed service, make this a no-op.
    ///
    /// Called from a subscriber callback, the tick is deferred until the
    /// current fan-out finishes and this returns 0. The outer call runs it
    /// and counts its samples.
    pub fn tick(&self) -> usize {
        let state = self.tick_lock.lock();
        if state.get().ticking {
            state.set(TickState {
                pending: true,
                ..state.get()
            });
            return 0;
        }

        let mut produced = 0;
        loop {
            state.set(TickState {
                ticking: true,
                pending: false,
                ..state.get()
            });
            produced += self.run_tick(&state);

            let current = state.get();
            state.set(TickState {
                ticking: false,
                ..current
            });
            if !current.pending {
                return produced;
            }
        }
    }

    fn run_tick(&self, state: &Cell<TickState>) -> usize {
        if self.is_destroyed() {
            return 0;
        }

        let mints = self.tracked.snapshot();
        if mints.is_empty() {
            return 0;
        }

        let started = Instant::now();
        let timestamp = next_timestamp(state.get().last, self.clock.now());
        state.set(TickState {
            last: Some(timestamp),
            ..state.get()
        });

        let samples: Vec<PriceSample> = {
            let mut rng = self.rng.lock();
            mints
                .iter()
                .map(|mint| pricing::generate(mint, &mut **rng, timestamp))
                .collect()
        };

        {
            let mut latest = self.latest.write();
            for sample in &samples {
                if self.tracked.contains(&sample.mint) {
                    latest.insert(sample.mint.clone(), sample.clone());
                }
            }
        }

        for sample in &samples {
            self.subscribers.fan_out(sample);
        }

        self.ticks.fetch_add(1, Ordering::Relaxed);
        metrics::record_tick(samples.len(), started.elapsed());
        tracing::trace!(samples = samples.len(), %timestamp, "Price tick");

        samples.len()
    }

    /// Interval between ticks.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop the service.
    ///
    /// Cancels the tick loop, drops every subscriber and tracked mint, and
    /// closes the broadcast channel. A tick already delivering samples may
    /// finish, but skips subscribers removed here. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        self.subscribers.close();
        self.tracked.clear();
        self.latest.write().clear();
        metrics::set_tracked_mints(0);

        tracing::info!(
            ticks = self.ticks.load(Ordering::Relaxed),
            "Price service destroyed"
        );
    }

    /// Whether the service is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.is_destroyed()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            running: self.is_running(),
            tracking: self.tracked.stats(),
            subscribers: self.subscribers.subscriber_count(),
            receivers: self.subscribers.receiver_count(),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Consumer Tracking (used by PriceWatch)
    // =========================================================================

    pub(crate) fn allocate_consumer(&self) -> ConsumerId {
        self.next_consumer.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn track_for(&self, consumer: ConsumerId, mints: &[Mint]) {
        if self.is_destroyed() {
            return;
        }

        let added = self.tracked.track_for(consumer, mints);
        if !added.is_empty() {
            tracing::debug!(consumer, mints = ?added, "Mints tracked for consumer");
        }
        metrics::set_tracked_mints(self.tracked.len());
    }

    pub(crate) fn untrack_for(&self, consumer: ConsumerId, mints: &[Mint]) {
        if self.is_destroyed() {
            return;
        }

        let removed = self.tracked.untrack_for(consumer, mints);
        self.forget(consumer, &removed);
    }

    pub(crate) fn release_consumer(&self, consumer: ConsumerId) {
        if self.is_destroyed() {
            return;
        }

        let removed = self.tracked.release_consumer(consumer);
        self.forget(consumer, &removed);
    }

    fn forget(&self, consumer: ConsumerId, removed: &[Mint]) {
        if !removed.is_empty() {
            let mut latest = self.latest.write();
            for mint in removed {
                latest.remove(mint);
            }
            tracing::debug!(consumer, mints = ?removed, "Mints released by consumer");
        }
        metrics::set_tracked_mints(self.tracked.len());
    }
}

impl Drop for PriceService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Tick bookkeeping guarded by the tick lock.
#[derive(Debug, Clone, Copy, Default)]
struct TickState {
    /// Timestamp of the previous tick.
    last: Option<DateTime<Utc>>,
    /// A fan-out is in progress on the lock-holding thread.
    ticking: bool,
    /// A tick was requested during that fan-out.
    pending: bool,
}

/// Timestamp for the next tick, strictly after the previous one.
fn next_timestamp(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + TimeDelta::milliseconds(1),
        _ => now,
    }
}

/// Drive ticks until cancelled or the service is dropped.
///
/// The first tick fires one interval after start. Missed ticks are skipped
/// rather than replayed in a burst.
async fn run_ticker(service: Weak<PriceService>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("Price ticker cancelled");
                break;
            }
            _ = interval.tick() => {
                let Some(service) = service.upgrade() else {
                    tracing::debug!("Price service dropped, stopping ticker");
                    break;
                };
                service.tick();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::TimeZone;

    use super::*;
    use crate::application::ports::MockClock;
    use crate::domain::pricing::{MIN_PRICE, PRICE_CURRENCY};

    const LONG: Duration = Duration::from_secs(3_600);

    fn config(interval: Duration) -> SimulatorConfig {
        SimulatorConfig::default().with_tick_interval(interval)
    }

    fn seeded(config: &SimulatorConfig) -> Arc<PriceService> {
        PriceService::start_with(
            config,
            Box::new(StdRng::seed_from_u64(11)),
            Arc::new(SystemClock),
        )
        .unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&PriceSample) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move |_: &PriceSample| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn start_without_runtime_fails() {
        let err = PriceService::start(&config(LONG)).unwrap_err();
        assert!(matches!(err, PriceServiceError::NoRuntime));
    }

    #[tokio::test]
    async fn start_with_zero_interval_fails() {
        let err = PriceService::start(&config(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, PriceServiceError::ZeroInterval));
    }

    #[tokio::test]
    async fn tick_without_tracked_mints_is_noop() {
        let service = seeded(&config(LONG));
        let (hits, callback) = counter();
        let _sub = service.subscribe(callback);

        assert_eq!(service.tick(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(service.stats().ticks, 0);
    }

    #[tokio::test]
    async fn tick_produces_one_sample_per_mint() {
        let service = seeded(&config(LONG));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = service.subscribe(move |sample| s.lock().push(sample.clone()));

        service.track("mint-B");
        service.track("mint-A");
        service.track("mint-A");

        assert_eq!(service.tick(), 2);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].mint, "mint-A");
        assert_eq!(seen[1].mint, "mint-B");
        for sample in seen.iter() {
            assert!(sample.price >= MIN_PRICE);
            assert_eq!(sample.currency, PRICE_CURRENCY);
        }
    }

    #[tokio::test]
    async fn untrack_stops_samples_and_clears_latest() {
        let service = seeded(&config(LONG));
        service.track("mint-A");
        service.tick();
        assert!(service.latest("mint-A").is_some());

        service.untrack("mint-A");
        service.untrack("mint-A");

        assert!(service.latest("mint-A").is_none());
        assert_eq!(service.tick(), 0);
    }

    #[tokio::test]
    async fn unsubscribed_callback_gets_nothing_further() {
        let service = seeded(&config(LONG));
        let (hits, callback) = counter();
        let sub = service.subscribe(callback);
        service.track("mint-A");

        service.tick();
        sub.unsubscribe();
        service.tick();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timestamps_strictly_increase_with_frozen_clock() {
        let frozen = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut clock = MockClock::new();
        clock.expect_now().return_const(frozen);

        let service = PriceService::start_with(
            &config(LONG),
            Box::new(StdRng::seed_from_u64(3)),
            Arc::new(clock),
        )
        .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = service.subscribe(move |sample| s.lock().push(sample.timestamp));
        service.track("mint-A");

        for _ in 0..3 {
            service.tick();
        }

        let seen = seen.lock();
        assert_eq!(seen[0], frozen);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn next_timestamp_handles_clock_going_backwards() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let earlier = t0 - TimeDelta::seconds(5);

        assert_eq!(next_timestamp(None, t0), t0);
        assert_eq!(next_timestamp(Some(t0), earlier), t0 + TimeDelta::milliseconds(1));
        assert_eq!(
            next_timestamp(Some(earlier), t0),
            t0,
            "a later clock reading is used as is"
        );
    }

    #[tokio::test]
    async fn callback_may_mutate_service_during_fan_out() {
        let service = seeded(&config(LONG));
        let weak = Arc::downgrade(&service);
        let _sub = service.subscribe(move |sample| {
            if sample.mint != "mint-A" {
                return;
            }
            if let Some(service) = weak.upgrade() {
                service.track("mint-B");
                service.untrack(&sample.mint);
                // Deferred until this fan-out finishes
                assert_eq!(service.tick(), 0);
            }
        });
        service.track("mint-A");

        // mint-A now, then the deferred tick for mint-B
        assert_eq!(service.tick(), 2);

        assert!(service.is_tracked("mint-B"));
        assert!(!service.is_tracked("mint-A"));
        assert_eq!(service.latest("mint-B").map(|s| s.mint), Some("mint-B".to_string()));
    }

    #[tokio::test]
    async fn nested_tick_keeps_order_for_later_subscribers() {
        let service = seeded(&config(LONG));
        let weak = Arc::downgrade(&service);
        let nested = AtomicBool::new(false);
        let _first = service.subscribe(move |_| {
            if !nested.swap(true, Ordering::SeqCst)
                && let Some(service) = weak.upgrade()
            {
                service.tick();
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _second = service.subscribe(move |sample| s.lock().push(sample.timestamp));
        service.track("mint-A");

        assert_eq!(service.tick(), 2);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0] < seen[1], "second subscriber saw {seen:?}");
        assert_eq!(service.stats().ticks, 2);
    }

    #[tokio::test]
    async fn destroy_makes_everything_a_noop() {
        let service = seeded(&config(LONG));
        let (hits, callback) = counter();
        let sub = service.subscribe(callback);
        service.track("mint-A");

        service.destroy();
        service.destroy();

        service.track("mint-B");
        service.untrack("mint-A");
        let (late_hits, late_callback) = counter();
        let late = service.subscribe(late_callback);

        assert!(!service.is_running());
        assert!(!sub.is_active());
        assert!(!late.is_active());
        assert!(service.tracked_mints().is_empty());
        assert_eq!(service.tick(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        assert_eq!(service.stats(), ServiceStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_on_interval() {
        let service = seeded(&config(Duration::from_millis(3_000)));
        let (hits, callback) = counter();
        let _sub = service.subscribe(callback);
        service.track("mint-A");

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_after_destroy() {
        let service = seeded(&config(Duration::from_millis(100)));
        let (hits, callback) = counter();
        let _sub = service.subscribe(callback);
        service.track("mint-A");

        tokio::time::sleep(Duration::from_millis(250)).await;
        let before = hits.load(Ordering::SeqCst);
        assert_eq!(before, 2);

        service.destroy();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(hits.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_service_stops_ticker() {
        let service = seeded(&config(Duration::from_millis(100)));
        let (hits, callback) = counter();
        let sub = service.subscribe(callback);
        service.track("mint-A");

        drop(service);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn receiver_gets_samples_and_closes_on_destroy() {
        let service = seeded(&config(LONG));
        let mut rx = service.receiver();
        service.track("mint-A");

        service.tick();
        assert_eq!(rx.recv().await.unwrap().mint, "mint-A");

        service.destroy();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn stats_reflect_state() {
        let service = seeded(&config(LONG));
        let _sub = service.subscribe(|_| {});
        let _rx = service.receiver();
        service.track("mint-A");
        service.tick();

        let stats = service.stats();
        assert!(stats.running);
        assert_eq!(stats.tracking.mint_count, 1);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.receivers, 1);
        assert_eq!(stats.ticks, 1);
    }
}
