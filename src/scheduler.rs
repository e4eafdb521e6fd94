use chrono::NaiveDateTime;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::alerts;
use crate::dispatcher::Dispatcher;
use crate::model::{Schedule, Trigger};
use crate::recurrence::Recurrence;
use crate::retry::{self, RetryDecision};
use crate::store::{Store, StoreError};

/// Polls the store for due schedules and runs them one at a time. A slow
/// task delays the rest of the pass, never a second copy of itself.
pub struct Scheduler {
    store: Store,
    dispatcher: Dispatcher,
    poll_interval: Duration,
}

/// Owned by whoever started the loop. Dropping it without calling stop
/// leaves the loop running until the runtime shuts down.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!("Scheduler task did not shut down cleanly: {}", e);
        }
    }
}

impl Scheduler {
    pub fn new(store: Store, dispatcher: Dispatcher, poll_interval: Duration) -> Self {
        Scheduler { store, dispatcher, poll_interval }
    }

    /// Spawns the polling loop. The first pass runs right away, later
    /// ones follow at the configured interval.
    pub fn start(self) -> SchedulerHandle {
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!("Scheduler started, polling every {} s", self.poll_interval.as_secs());
            let mut ticker = interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_tick().await {
                            error!("Scheduler pass failed: {}", e);
                        }
                    }
                    _ = stop_rx.changed() => {
                        info!("Scheduler shutdown initiated");
                        break;
                    }
                }
            }
        });
        SchedulerHandle { stop, handle }
    }

    /// One polling pass. A schedule that blows up is logged and skipped,
    /// the rest of the pass still runs.
    pub async fn run_tick(&self) -> Result<(), StoreError> {
        let now = self.store.now();
        let due = self.store.due_schedules(now).await?;
        if due.is_empty() {
            debug!("No schedules due at {}", now.format("%Y-%m-%d %H:%M:%S"));
            return Ok(());
        }
        info!("{} schedule(s) due at {}", due.len(), now.format("%Y-%m-%d %H:%M:%S"));
        for schedule in due {
            if let Err(e) = self.fire_schedule(&schedule).await {
                error!("Schedule '{}' (id {}) failed to run: {}", schedule.name, schedule.id, e);
            }
        }
        Ok(())
    }

    async fn fire_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let Some(task) = self.store.task(schedule.task_id).await? else {
            warn!("Schedule '{}' points at a missing task, disabling it", schedule.name);
            self.store.set_schedule_active(schedule.id, false, None).await?;
            return Ok(());
        };

        let execution = self.dispatcher.dispatch(&task, Trigger::Scheduler).await?;

        match retry::decide(execution.status, schedule.retry_count, schedule.retry_budget) {
            RetryDecision::Proceed => {
                let (next, active) = self.advance(schedule);
                self.store.apply_outcome(schedule.id, next, 0, active).await?;
                alerts::on_outcome(&self.store, &task, Some(schedule), &execution, false).await?;
            }
            RetryDecision::RetryIn(delay) => {
                let next = self.store.now() + delay;
                let attempt = schedule.retry_count + 1;
                info!(
                    "Task '{}' ended with {} on attempt {}/{}, retrying at {}",
                    task.title,
                    execution.status,
                    attempt,
                    schedule.retry_budget + 1,
                    next.format("%Y-%m-%d %H:%M:%S"),
                );
                self.store.apply_outcome(schedule.id, Some(next), attempt, true).await?;
            }
            RetryDecision::GiveUp => {
                warn!(
                    "Task '{}' exhausted its retry budget of {}, giving up until the next slot",
                    task.title, schedule.retry_budget
                );
                let (next, active) = self.advance(schedule);
                self.store.apply_outcome(schedule.id, next, 0, active).await?;
                alerts::on_outcome(&self.store, &task, Some(schedule), &execution, true).await?;
            }
        }
        Ok(())
    }

    /// Next slot on the regular cadence. One-shot schedules are done at
    /// this point and get switched off.
    fn advance(&self, schedule: &Schedule) -> (Option<NaiveDateTime>, bool) {
        if let Recurrence::Once { .. } = schedule.recurrence {
            info!("One-shot schedule '{}' has run, deactivating it", schedule.name);
            return (None, false);
        }
        match schedule.recurrence.next_fire(self.store.now()) {
            Some(next) => (Some(next), true),
            None => {
                error!(
                    "Schedule '{}' cannot produce a next run from '{}', it will not fire again",
                    schedule.name, schedule.recurrence
                );
                (None, true)
            }
        }
    }
}
