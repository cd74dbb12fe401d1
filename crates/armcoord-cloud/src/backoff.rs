//! Poll timing: configurable defaults and bounded exponential backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for one convergence wait
///
/// Every field can be overridden per wait with the `PollSpec` builders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Settling period before the first probe (milliseconds)
    #[serde(default)]
    pub initial_delay_ms: u64,
    /// Interval after the first pending observation (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound for the interval (milliseconds)
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
    /// Growth factor applied after each pending observation
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Consecutive target observations required before success
    #[serde(default = "default_continuous_target_occurrence")]
    pub continuous_target_occurrence: u32,
}

fn default_poll_interval() -> u64 {
    10_000
}
fn default_max_poll_interval() -> u64 {
    60_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_continuous_target_occurrence() -> u32 {
    1
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            poll_interval_ms: default_poll_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
            backoff_multiplier: default_multiplier(),
            continuous_target_occurrence: default_continuous_target_occurrence(),
        }
    }
}

impl PollConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval_ms = millis(interval);
        self
    }

    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences;
        self
    }
}

/// Non-decreasing interval sequence capped at a maximum
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// A multiplier below 1.0 is treated as 1.0; an initial interval above
    /// `max` starts at `max`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        Self {
            current: initial.min(max),
            max,
            multiplier,
        }
    }

    /// Interval to use now, without growing
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the current interval and grow the next one
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        let grown = interval.as_secs_f64() * self.multiplier;
        self.current = if grown >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(grown).max(interval)
        };
        interval
    }
}
