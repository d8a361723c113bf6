//! Simulator Configuration Settings
//!
//! Configuration types for the price simulator, loaded from environment
//! variables.

use std::time::Duration;

use crate::domain::pricing::Mint;

/// Default interval between price ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(3_000);

/// Tick scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Interval between ticks.
    pub tick_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// Broadcast channel settings.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastSettings {
    /// Capacity of the sample broadcast channel.
    pub channel_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

/// Complete simulator configuration.
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    /// Tick scheduler settings.
    pub scheduler: SchedulerSettings,
    /// Broadcast channel settings.
    pub broadcast: BroadcastSettings,
    /// Mints tracked from startup.
    pub mints: Vec<Mint>,
}

impl SimulatorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but not usable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// Unparsable numbers fall back to their defaults; zero intervals and
    /// capacities are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but not usable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let interval_ms = parse_u64(
            &lookup,
            "PRICE_SIM_INTERVAL_MS",
            duration_millis(DEFAULT_TICK_INTERVAL),
        );
        if interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PRICE_SIM_INTERVAL_MS".to_string(),
                reason: "tick interval must be greater than zero".to_string(),
            });
        }

        let channel_capacity = parse_usize(
            &lookup,
            "PRICE_SIM_BROADCAST_CAPACITY",
            BroadcastSettings::default().channel_capacity,
        );
        if channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PRICE_SIM_BROADCAST_CAPACITY".to_string(),
                reason: "channel capacity must be greater than zero".to_string(),
            });
        }

        let mints = lookup("PRICE_SIM_MINTS")
            .map(|raw| parse_mints(&raw))
            .unwrap_or_default();

        Ok(Self {
            scheduler: SchedulerSettings {
                tick_interval: Duration::from_millis(interval_ms),
            },
            broadcast: BroadcastSettings { channel_capacity },
            mints,
        })
    }

    /// Override the tick interval.
    #[must_use]
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.scheduler.tick_interval = tick_interval;
        self
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable holds a value that cannot be used.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending variable.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Split a comma-separated mint list, dropping blanks and duplicates.
fn parse_mints(raw: &str) -> Vec<Mint> {
    let mut mints: Vec<Mint> = Vec::new();
    for mint in raw.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        if !mints.iter().any(|m| m == mint) {
            mints.push(mint.to_string());
        }
    }
    mints
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_u64<F>(lookup: &F, key: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_usize<F>(lookup: &F, key: &str, default: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = SimulatorConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(3_000));
        assert_eq!(config.broadcast.channel_capacity, 1_024);
        assert!(config.mints.is_empty());
    }

    #[test]
    fn reads_all_values() {
        let config = SimulatorConfig::from_lookup(lookup_from(&[
            ("PRICE_SIM_INTERVAL_MS", "500"),
            ("PRICE_SIM_BROADCAST_CAPACITY", "64"),
            ("PRICE_SIM_MINTS", "mint-A, mint-B"),
        ]))
        .unwrap();

        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(500));
        assert_eq!(config.broadcast.channel_capacity, 64);
        assert_eq!(config.mints, vec!["mint-A".to_string(), "mint-B".to_string()]);
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let config = SimulatorConfig::from_lookup(lookup_from(&[
            ("PRICE_SIM_INTERVAL_MS", "soon"),
            ("PRICE_SIM_BROADCAST_CAPACITY", "-3"),
        ]))
        .unwrap();

        assert_eq!(config.scheduler.tick_interval, DEFAULT_TICK_INTERVAL);
        assert_eq!(config.broadcast.channel_capacity, 1_024);
    }

    #[test]
    fn zero_interval_rejected() {
        let err = SimulatorConfig::from_lookup(lookup_from(&[("PRICE_SIM_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("PRICE_SIM_INTERVAL_MS"));
    }

    #[test]
    fn zero_capacity_rejected() {
        let err =
            SimulatorConfig::from_lookup(lookup_from(&[("PRICE_SIM_BROADCAST_CAPACITY", "0")]))
                .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn mint_list_parsing() {
        assert_eq!(
            parse_mints(" a ,, b,a , "),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(parse_mints("").is_empty());
    }

    #[test]
    fn with_tick_interval_overrides() {
        let config = SimulatorConfig::default().with_tick_interval(Duration::from_millis(10));
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(10));
    }
}
