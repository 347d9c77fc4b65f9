//! Scheduler leader election.
//!
//! Every manager enters the election by creating an ephemeral-sequential
//! candidate node under the leader path; the candidate with the smallest
//! sequence is the leader. Standbys block on child watches and re-check
//! when the membership changes, so a dead leader's vanished ephemeral
//! promotes the next candidate without polling storms.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::SchedulerConfig;
use crate::coordinator::{paths, Coordinator, CoordinatorError, CreateMode};
use crate::error::WorkflowResult;
use crate::scheduler::Scheduler;

const CANDIDATE_PREFIX: &str = "candidate-";
const STANDBY_RECHECK: Duration = Duration::from_secs(1);

/// Leadership held by this process. Dropped ephemeral nodes release it
/// implicitly; `release` does so eagerly.
struct LeaderLease {
    coordinator: Arc<dyn Coordinator>,
    candidate_path: String,
}

impl LeaderLease {
    async fn release(self) {
        match self.coordinator.delete(&self.candidate_path).await {
            Ok(()) | Err(CoordinatorError::NotFound { .. }) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to withdraw leader candidate node");
            }
        }
    }
}

struct LeaderElection {
    coordinator: Arc<dyn Coordinator>,
}

impl LeaderElection {
    /// Enters the election and blocks until this process is first in
    /// line or shutdown is signalled. Returns `None` on shutdown.
    async fn acquire(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WorkflowResult<Option<LeaderLease>> {
        let candidate_path = self
            .coordinator
            .create(
                &format!("{}/{CANDIDATE_PREFIX}", paths::SCHEDULER_LEADER_PATH),
                Vec::new(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let candidate_name = candidate_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let mut membership_watch = self
            .coordinator
            .watch_children(paths::SCHEDULER_LEADER_PATH);

        loop {
            if *shutdown.borrow() {
                let _ = self.coordinator.delete(&candidate_path).await;
                return Ok(None);
            }

            let mut candidates = self
                .coordinator
                .children(paths::SCHEDULER_LEADER_PATH)
                .await?;
            candidates.retain(|name| name.starts_with(CANDIDATE_PREFIX));
            candidates.sort();

            if !candidates.iter().any(|name| name == &candidate_name) {
                // Our ephemeral is gone: the session was lost.
                return Err(CoordinatorError::SessionExpired.into());
            }
            if candidates.first().map(String::as_str) == Some(candidate_name.as_str()) {
                return Ok(Some(LeaderLease {
                    coordinator: Arc::clone(&self.coordinator),
                    candidate_path,
                }));
            }

            tokio::select! {
                () = tokio::time::sleep(STANDBY_RECHECK) => {}
                _ = membership_watch.recv() => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

/// Drives the election and hands the scheduler its leadership tenures:
/// standby until elected, run the control loop, release on error or
/// shutdown, re-enter the election after a backoff.
pub(crate) struct SchedulerSelector {
    coordinator: Arc<dyn Coordinator>,
    scheduler: Scheduler,
    config: SchedulerConfig,
}

impl SchedulerSelector {
    pub(crate) fn new(
        coordinator: Arc<dyn Coordinator>,
        scheduler: Scheduler,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            coordinator,
            scheduler,
            config,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let election = LeaderElection {
            coordinator: Arc::clone(&self.coordinator),
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            let lease = match election.acquire(&mut shutdown).await {
                Ok(Some(lease)) => lease,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Leader election failed; backing off");
                    if Self::backoff(&mut shutdown, self.config.error_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            tracing::info!("Acquired scheduler leadership");
            let outcome = self.scheduler.run_as_leader(&mut shutdown).await;
            lease.release().await;
            tracing::info!("Released scheduler leadership");

            if let Err(e) = outcome {
                tracing::warn!(error = %e, "Scheduler tenure ended with error; backing off");
                if Self::backoff(&mut shutdown, self.config.error_backoff).await {
                    break;
                }
            }
        }
    }

    /// Sleeps for `duration` unless shutdown fires first. Returns true
    /// when the loop should stop.
    async fn backoff(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
        *shutdown.borrow()
    }
}
