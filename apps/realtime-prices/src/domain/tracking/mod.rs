//! Tracked Mint Registry
//!
//! Tracks which mints currently need simulated price updates.
//!
//! # Design
//!
//! A mint is tracked while at least one holder claims it. Holders are
//! either direct callers of [`TrackedSet::track`] or individual consumers
//! (price watches) identified by a [`ConsumerId`]. Counting holders lets
//! several consumers watch the same mint: detaching one of them leaves the
//! mint tracked for the others.

use std::collections::{BTreeMap, HashSet};

use parking_lot::RwLock;

use crate::domain::pricing::Mint;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a consumer holding tracked mints.
pub type ConsumerId = u64;

/// Who keeps a mint in the tracked set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Holder {
    /// Plain `track`/`untrack` calls.
    Direct,
    /// A specific consumer.
    Consumer(ConsumerId),
}

/// Statistics about the tracked set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingStats {
    /// Number of tracked mints.
    pub mint_count: usize,
    /// Number of consumers holding at least one mint.
    pub consumer_count: usize,
}

// =============================================================================
// Tracking State
// =============================================================================

#[derive(Debug, Default)]
struct TrackingState {
    /// Mint to the holders keeping it tracked.
    holders: BTreeMap<Mint, HashSet<Holder>>,
}

impl TrackingState {
    /// Add a claim. Returns true if the mint became tracked.
    fn claim(&mut self, holder: Holder, mint: &str) -> bool {
        if let Some(set) = self.holders.get_mut(mint) {
            set.insert(holder);
            return false;
        }

        self.holders
            .insert(mint.to_string(), HashSet::from([holder]));
        true
    }

    /// Drop a claim. Returns true if the mint stopped being tracked.
    fn release(&mut self, holder: Holder, mint: &str) -> bool {
        let Some(set) = self.holders.get_mut(mint) else {
            return false;
        };

        if !set.remove(&holder) || !set.is_empty() {
            return false;
        }

        self.holders.remove(mint);
        true
    }

    /// Drop every claim held by `consumer`.
    fn release_consumer(&mut self, consumer: ConsumerId) -> Vec<Mint> {
        let holder = Holder::Consumer(consumer);
        let mut removed = Vec::new();

        self.holders.retain(|mint, set| {
            if set.remove(&holder) && set.is_empty() {
                removed.push(mint.clone());
                return false;
            }
            true
        });

        removed
    }

    fn consumer_count(&self) -> usize {
        self.holders
            .values()
            .flatten()
            .filter_map(|holder| match holder {
                Holder::Consumer(id) => Some(*id),
                Holder::Direct => None,
            })
            .collect::<HashSet<_>>()
            .len()
    }
}

// =============================================================================
// Tracked Set
// =============================================================================

/// Thread-safe set of mints that receive simulated price updates.
///
/// # Example
///
/// ```rust
/// use realtime_prices::domain::tracking::TrackedSet;
///
/// let tracked = TrackedSet::new();
///
/// // Two consumers watch the same mint
/// tracked.track_for(1, &["mint-A".to_string()]);
/// tracked.track_for(2, &["mint-A".to_string()]);
///
/// // Consumer 1 leaves, the mint is still tracked for consumer 2
/// assert!(tracked.release_consumer(1).is_empty());
/// assert!(tracked.contains("mint-A"));
///
/// // Consumer 2 leaves, the mint is gone
/// assert_eq!(tracked.release_consumer(2), vec!["mint-A".to_string()]);
/// assert!(tracked.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct TrackedSet {
    state: RwLock<TrackingState>,
}

impl TrackedSet {
    /// Create an empty tracked set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a mint. Idempotent.
    ///
    /// Returns true if the mint was not tracked before.
    pub fn track(&self, mint: &str) -> bool {
        self.state.write().claim(Holder::Direct, mint)
    }

    /// Stop tracking a mint. Idempotent, absent mints are ignored.
    ///
    /// Only drops the direct claim; the mint stays tracked while any
    /// consumer still holds it. Returns true if the mint stopped being
    /// tracked.
    pub fn untrack(&self, mint: &str) -> bool {
        self.state.write().release(Holder::Direct, mint)
    }

    /// Track mints on behalf of a consumer.
    ///
    /// Returns the mints that became tracked.
    pub fn track_for(&self, consumer: ConsumerId, mints: &[Mint]) -> Vec<Mint> {
        let mut state = self.state.write();
        mints
            .iter()
            .filter(|mint| state.claim(Holder::Consumer(consumer), mint))
            .cloned()
            .collect()
    }

    /// Release mints held by a consumer.
    ///
    /// Returns the mints that stopped being tracked.
    pub fn untrack_for(&self, consumer: ConsumerId, mints: &[Mint]) -> Vec<Mint> {
        let mut state = self.state.write();
        mints
            .iter()
            .filter(|mint| state.release(Holder::Consumer(consumer), mint))
            .cloned()
            .collect()
    }

    /// Release everything a consumer holds.
    ///
    /// Returns the mints that stopped being tracked.
    pub fn release_consumer(&self, consumer: ConsumerId) -> Vec<Mint> {
        self.state.write().release_consumer(consumer)
    }

    /// Whether a mint is tracked.
    #[must_use]
    pub fn contains(&self, mint: &str) -> bool {
        self.state.read().holders.contains_key(mint)
    }

    /// Copy of the tracked mints, in sorted order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Mint> {
        self.state.read().holders.keys().cloned().collect()
    }

    /// Number of tracked mints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().holders.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().holders.is_empty()
    }

    /// Drop every claim.
    pub fn clear(&self) {
        self.state.write().holders.clear();
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> TrackingStats {
        let state = self.state.read();
        TrackingStats {
            mint_count: state.holders.len(),
            consumer_count: state.consumer_count(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
