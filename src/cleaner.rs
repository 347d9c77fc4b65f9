//! Automatic removal of old completed runs.
//!
//! The scheduler leader periodically sweeps run summaries through an
//! [`AutoCleaner`] predicate and cleans whatever it approves. The
//! standard policy keeps completed runs around for a minimum age so
//! results stay queryable for a while.

use std::time::{Duration, Instant};

use chrono::Utc;

use crate::models::RunInfo;

/// Decides whether a run's records may be removed.
pub trait AutoCleaner: Send + Sync {
    /// Returns true if the run may be cleaned now.
    fn can_be_cleaned(&self, run_info: &RunInfo) -> bool;
}

/// Standard policy: clean a run once it has been complete for at least
/// `min_age`.
#[derive(Debug, Clone)]
pub struct StandardAutoCleaner {
    min_age: chrono::Duration,
}

impl StandardAutoCleaner {
    /// Creates the policy with the given minimum completed age.
    #[must_use]
    pub const fn new(min_age: chrono::Duration) -> Self {
        Self { min_age }
    }
}

impl AutoCleaner for StandardAutoCleaner {
    fn can_be_cleaned(&self, run_info: &RunInfo) -> bool {
        match run_info.completion_time_utc {
            Some(completed_at) => Utc::now() - completed_at >= self.min_age,
            None => false,
        }
    }
}

/// Tracks when the next sweep is due. Owned by the scheduler; sweeps run
/// only while holding leadership.
pub(crate) struct AutoCleanerHolder {
    cleaner: Option<std::sync::Arc<dyn AutoCleaner>>,
    period: Duration,
    last_sweep: Instant,
}

impl AutoCleanerHolder {
    pub(crate) fn new(cleaner: Option<std::sync::Arc<dyn AutoCleaner>>, period: Duration) -> Self {
        Self {
            cleaner,
            period,
            last_sweep: Instant::now(),
        }
    }

    /// Returns true when a cleaner is configured and the sweep period
    /// has elapsed.
    pub(crate) fn is_due(&self) -> bool {
        self.cleaner.is_some() && self.last_sweep.elapsed() >= self.period
    }

    pub(crate) fn mark_swept(&mut self) {
        self.last_sweep = Instant::now();
    }

    pub(crate) fn cleaner(&self) -> Option<&std::sync::Arc<dyn AutoCleaner>> {
        self.cleaner.as_ref()
    }
}
