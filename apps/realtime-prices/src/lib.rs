#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Realtime Prices - Simulated NFT Price Stream
//!
//! An in-process publish/subscribe service that periodically emits
//! simulated price updates for a dynamic set of Solana NFT mints and
//! distributes them to interested consumers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Price generation and tracked-mint bookkeeping
//!   - `pricing`: Price samples, base price derivation, fluctuation
//!   - `tracking`: The set of mints currently being priced
//!
//! - **Application**: The service and its per-consumer view
//!   - `ports`: Clock abstraction
//!   - `services`: Price service (tick loop) and price watch
//!
//! - **Infrastructure**: Distribution and ambient concerns
//!   - `broadcast`: Subscriber registry and broadcast channel
//!   - `config`: Environment-based configuration
//!   - `metrics`: Prometheus metrics
//!   - `telemetry`: Logging and optional OTLP export
//!
//! # Data Flow
//!
//! ```text
//! track(mint) ──► TrackedSet ──► tick ──► PriceSample ──┬──► callback 1
//!                                  ▲                    ├──► callback N
//!                          every interval               └──► broadcast channel
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Pricing and tracking with no runtime dependencies.
pub mod domain;

/// Application layer - Price service and consumer views.
pub mod application;

/// Infrastructure layer - Distribution, configuration and observability.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::pricing::{Mint, PRICE_CURRENCY, PriceSample};
pub use domain::tracking::{ConsumerId, TrackedSet, TrackingStats};

// Application
pub use application::ports::{Clock, SystemClock};
pub use application::services::{PriceService, PriceServiceError, PriceWatch, ServiceStats};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ConfigError, DEFAULT_TICK_INTERVAL, SchedulerSettings, SimulatorConfig,
};

// Subscriber registry
pub use infrastructure::broadcast::{
    BroadcastConfig, FanOutReport, SubscriberId, SubscriberRegistry, Subscription,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
