//! Sync scheduling: periodic timer plus on-demand triggers.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use notesync_common::Result;

use crate::manager::{CycleOutcome, SyncManager};

/// What woke the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Nudge,
}

/// Scheduler for running sync cycles.
///
/// One loop drives [`SyncManager::run_cycle`] on a fixed interval and
/// whenever the manager is nudged (local writes, [`SchedulerHandle::trigger`]).
/// The manager's gate guarantees cycles never overlap.
pub struct SyncScheduler {
    manager: Arc<SyncManager>,
    interval: Duration,
    cancel: CancellationToken,
}

impl SyncScheduler {
    /// Create a scheduler using the manager's poll interval.
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self {
            interval: manager.config().poll_interval,
            cancel: manager.cancellation_token(),
            manager,
        }
    }

    /// Override the interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Handle for triggering and stopping the scheduler.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            manager: self.manager.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run the scheduler on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the scheduler loop until cancelled.
    ///
    /// The first tick fires immediately, so a cycle runs at startup.
    pub async fn run(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Sync scheduler started (interval {:?})", self.interval);

        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => Trigger::Timer,
                _ = self.manager.nudged() => Trigger::Nudge,
            };
            debug!("Sync triggered by {:?}", trigger);

            match self.manager.run_cycle().await {
                Ok(CycleOutcome::Completed(report)) => {
                    debug!("Cycle finished after {} pass(es)", report.passes);
                }
                Ok(CycleOutcome::Coalesced) => {
                    debug!("Cycle already running; rerun requested");
                }
                Err(e) => {
                    error!("Sync cycle failed: {}", e);
                }
            }
        }

        info!("Sync scheduler shutting down");
    }
}

/// Handle for a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    manager: Arc<SyncManager>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Ask for a cycle without waiting for it.
    pub fn trigger(&self) {
        self.manager.nudge();
    }

    /// Run a cycle now and wait for it.
    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        self.manager.sync_now().await
    }

    /// Stop the scheduler. A running cycle stops at the next item.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
