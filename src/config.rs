//! Tuning knobs for the consumer and scheduler loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling strategy for a queue consumer when no work is available.
///
/// - `Fixed`: constant interval (predictable latency, more list calls)
/// - `Adaptive`: exponential backoff when idle (fewer list calls,
///   variable latency)
///
/// Consumers also wake on queue child watches, so polling mostly covers
/// delay-mode deliveries and missed notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PollingStrategy {
    /// Fixed interval polling.
    Fixed {
        /// Poll interval in milliseconds.
        interval_ms: u64,
    },

    /// Adaptive polling with exponential backoff.
    Adaptive {
        /// Minimum interval in milliseconds (used when work was found).
        min_interval_ms: u64,
        /// Maximum interval in milliseconds (idle cap).
        max_interval_ms: u64,
        /// Backoff multiplier (typically 2.0).
        backoff_multiplier: f64,
    },
}

impl Default for PollingStrategy {
    fn default() -> Self {
        Self::Adaptive {
            min_interval_ms: 50,
            max_interval_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl PollingStrategy {
    /// Creates a fixed polling strategy.
    #[must_use]
    pub const fn fixed(interval_ms: u64) -> Self {
        Self::Fixed { interval_ms }
    }

    /// Creates an adaptive polling strategy with the default multiplier.
    #[must_use]
    pub const fn adaptive(min_interval_ms: u64, max_interval_ms: u64) -> Self {
        Self::Adaptive {
            min_interval_ms,
            max_interval_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Returns the initial polling interval.
    #[must_use]
    pub const fn initial_interval(&self) -> Duration {
        match self {
            Self::Fixed { interval_ms } => Duration::from_millis(*interval_ms),
            Self::Adaptive {
                min_interval_ms, ..
            } => Duration::from_millis(*min_interval_ms),
        }
    }

    /// Calculates the next polling interval.
    ///
    /// Fixed strategy always returns the same interval. Adaptive resets
    /// to the minimum when work was found and backs off toward the cap
    /// otherwise.
    #[must_use]
    pub fn next_interval(&self, current: Duration, found_work: bool) -> Duration {
        match self {
            Self::Fixed { interval_ms } => Duration::from_millis(*interval_ms),
            Self::Adaptive {
                min_interval_ms,
                max_interval_ms,
                backoff_multiplier,
            } => {
                if found_work {
                    Duration::from_millis(*min_interval_ms)
                } else {
                    #[allow(
                        clippy::cast_possible_truncation,
                        clippy::cast_sign_loss,
                        clippy::cast_precision_loss
                    )]
                    let next_ms = (current.as_millis() as f64 * backoff_multiplier) as u64;
                    Duration::from_millis(next_ms.min(*max_interval_ms))
                }
            }
        }
    }

    /// Applies +/-10% jitter to an interval to prevent thundering herd.
    #[must_use]
    pub fn apply_jitter(&self, interval: Duration) -> Duration {
        let jitter_factor = rand::random::<f64>().mul_add(0.2, 0.9);
        Duration::from_secs_f64(interval.as_secs_f64() * jitter_factor)
    }
}

/// Configuration for queue consumers.
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    /// Idle polling strategy.
    pub polling: PollingStrategy,
}

/// Configuration for the scheduler leader loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound between scheduling passes. Child watches on runs and
    /// completed tasks wake the loop earlier.
    pub scan_interval: Duration,
    /// Backoff after a coordinator error before re-entering election.
    pub error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }
}
