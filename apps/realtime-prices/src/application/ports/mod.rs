//! Port Interfaces
//!
//! Contracts for the collaborators the price service consumes.
//!
//! - `Clock`: source of sample timestamps

use chrono::{DateTime, Utc};

/// Source of wall-clock time for sample timestamps.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
