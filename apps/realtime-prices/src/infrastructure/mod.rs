//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete delivery, configuration and observability plumbing used by the
//! application services.

/// Subscriber registry and broadcast channel for sample distribution.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
