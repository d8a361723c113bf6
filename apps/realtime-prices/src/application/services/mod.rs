//! Application Services
//!
//! - `PriceService`: owns the tick loop, tracked mints and subscribers
//! - `PriceWatch`: per-consumer view of the latest price for chosen mints

/// Update scheduler driving simulated price ticks.
pub mod price_service;

/// Per-consumer projection of the price stream.
pub mod price_watch;

pub use price_service::{PriceService, PriceServiceError, ServiceStats};
pub use price_watch::PriceWatch;
