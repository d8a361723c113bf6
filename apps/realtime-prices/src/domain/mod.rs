//! Domain Layer - Core price simulation types.
//!
//! Pure types and functions for simulated price samples and the set of
//! mints being tracked. Nothing here touches timers or I/O.

/// Price samples and the fluctuation generator.
pub mod pricing;

/// Tracked mint registry.
pub mod tracking;
