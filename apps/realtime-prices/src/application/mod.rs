//! Application Layer - Services and port definitions.
//!
//! This layer wires the domain types into the running price service and
//! the per-consumer views built on top of it.

/// Port interfaces for external collaborators (clock).
pub mod ports;

/// The price service (update scheduler) and per-consumer price watches.
pub mod services;
