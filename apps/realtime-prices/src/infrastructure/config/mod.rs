//! Configuration Module
//!
//! Configuration loading for the price simulator.

mod settings;

pub use settings::{
    BroadcastSettings, ConfigError, DEFAULT_TICK_INTERVAL, SchedulerSettings, SimulatorConfig,
};
