//! Price Samples and Fluctuation Generator
//!
//! Domain types for simulated NFT price updates and the pure functions that
//! produce them.
//!
//! # Model
//!
//! Every mint address maps to a stable *base price* derived from a string
//! hash of the address. Each tick perturbs that base by a uniform random
//! fluctuation in `[-5%, +5%)` and floors the result at [`MIN_PRICE`].
//! The generator holds no state; randomness is supplied by the caller.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Currency every simulated price is quoted in.
pub const PRICE_CURRENCY: &str = "SOL";

/// Lowest price a sample may report.
pub const MIN_PRICE: f64 = 0.01;

/// Largest absolute fluctuation applied to a base price (5%).
pub const MAX_FLUCTUATION: f64 = 0.05;

/// Upper bound (exclusive) of the simulated 24h volume.
pub const MAX_VOLUME: f64 = 1_000.0;

/// Lowest base price produced by [`base_price`].
pub const BASE_PRICE_FLOOR: f64 = 10.0;

/// Number of distinct base price steps above [`BASE_PRICE_FLOOR`].
const BASE_PRICE_BUCKETS: i32 = 100;

// =============================================================================
// Types
// =============================================================================

/// A mint address identifying one trackable NFT.
pub type Mint = String;

/// One simulated price observation for a mint.
///
/// Samples are immutable; a newer sample for the same mint replaces the
/// older one wholesale in any consumer-visible state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSample {
    /// Mint address the price belongs to.
    #[serde(rename = "mintAddress")]
    pub mint: Mint,
    /// Simulated price, never below [`MIN_PRICE`].
    pub price: f64,
    /// Quote currency, always [`PRICE_CURRENCY`].
    pub currency: String,
    /// When the sample was produced, as epoch milliseconds on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Fluctuation applied to the base price, in percent.
    #[serde(rename = "change24h")]
    pub change_pct: f64,
    /// Simulated 24h volume, never negative.
    #[serde(rename = "volume24h")]
    pub volume: f64,
}

impl PriceSample {
    /// Whether this sample's price went up relative to its base.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.change_pct > 0.0
    }
}

// =============================================================================
// Generator
// =============================================================================

/// Derive the stable base price of a mint.
///
/// Folds the UTF-16 code units of the address through a 32-bit
/// `acc * 31 + unit` accumulator (written as `(acc << 5) - acc + unit`),
/// then maps it into `[10, 110)`.
#[must_use]
pub fn base_price(mint: &str) -> f64 {
    let hash = mint.encode_utf16().fold(0_i32, |acc, unit| {
        acc.wrapping_shl(5)
            .wrapping_sub(acc)
            .wrapping_add(i32::from(unit))
    });

    f64::from((hash % BASE_PRICE_BUCKETS).abs()) + BASE_PRICE_FLOOR
}

/// Apply a relative fluctuation to a base price, flooring at [`MIN_PRICE`].
#[must_use]
pub fn apply_fluctuation(base: f64, fluctuation: f64) -> f64 {
    (base * (1.0 + fluctuation)).max(MIN_PRICE)
}

/// Map a uniform draw in `[0, 1)` onto a fluctuation in `[-5%, +5%)`.
#[must_use]
pub fn fluctuation_from_unit(unit: f64) -> f64 {
    (unit - 0.5) * (2.0 * MAX_FLUCTUATION)
}

/// Produce the next sample for `mint`.
///
/// Consumes two uniform draws from `rng`: one for the price fluctuation and
/// one for the volume.
pub fn generate<R>(mint: &str, rng: &mut R, timestamp: DateTime<Utc>) -> PriceSample
where
    R: Rng + ?Sized,
{
    let fluctuation = fluctuation_from_unit(rng.random::<f64>());
    let volume = rng.random::<f64>() * MAX_VOLUME;

    PriceSample {
        mint: mint.to_string(),
        price: apply_fluctuation(base_price(mint), fluctuation),
        currency: PRICE_CURRENCY.to_string(),
        timestamp,
        change_pct: fluctuation * 100.0,
        volume,
    }
}

// =============================================================================
// Tests
// =============================================================================
