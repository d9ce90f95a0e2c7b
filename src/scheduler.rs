//! Reconciliation scheduler.
//!
//! Two background loops keep activity state in line with wall-clock time,
//! on a fixed cadence, independent of any request:
//!
//! - the missed-deadline check moves overdue pending activities to
//!   `Missed`;
//! - the due-soon check fires a one-time reminder for pending activities
//!   whose deadline is closer than their notification lead time.
//!
//! Each check batches its store writes first and publishes events only for
//! transitions that actually committed, so a notification is never emitted
//! for state that did not stick. A failed iteration is logged and
//! abandoned; the next tick starts fresh. Scheduler failures are never
//! fatal to the process.

use crate::activity::{Activity, ActivityStatus};
use crate::events::{ActivityEvent, EventBus, EventKind};
use crate::store::ActivityStore;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default interval between reconciliation ticks (seconds).
pub const DEFAULT_TICK_SECS: u64 = 60;

/// Periodic state reconciler over an [`ActivityStore`], publishing one
/// event per committed transition to the [`EventBus`].
pub struct Scheduler {
    store: Arc<dyn ActivityStore>,
    bus: EventBus,
    tick_interval: Duration,
}

/// Handle for the running scheduler loops.
///
/// Dropping the handle (or calling [`shutdown`](Self::shutdown)) signals
/// both loops to stop at their next select point; an in-flight scan
/// iteration finishes rather than being interrupted mid-batch.
pub struct SchedulerHandle {
    stop_txs: Vec<mpsc::Sender<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signals both loops to stop and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.stop_txs.clear();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn ActivityStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            tick_interval: Duration::from_secs(DEFAULT_TICK_SECS),
        }
    }

    /// Overrides the tick interval (default 60s).
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Spawns the two background check loops and returns their handle.
    pub fn run(self) -> SchedulerHandle {
        let scheduler = Arc::new(self);
        info!(
            "Scheduler started, tick interval {}s",
            scheduler.tick_interval.as_secs()
        );

        // One stop channel per loop; loops observe shutdown as the
        // channel closing when the handle drops its senders.
        let (missed_stop_tx, mut missed_stop) = mpsc::channel::<()>(1);
        let (due_soon_stop_tx, mut due_soon_stop) = mpsc::channel::<()>(1);

        let missed = Arc::clone(&scheduler);
        let missed_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(missed.tick_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = missed.check_missed().await {
                            warn!("Missed-deadline check failed, retrying next tick: {}", e);
                        }
                    }
                    _ = missed_stop.recv() => break,
                }
            }
        });

        let due_soon = scheduler;
        let due_soon_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(due_soon.tick_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = due_soon.check_due_soon().await {
                            warn!("Due-soon check failed, retrying next tick: {}", e);
                        }
                    }
                    _ = due_soon_stop.recv() => break,
                }
            }
        });

        SchedulerHandle {
            stop_txs: vec![missed_stop_tx, due_soon_stop_tx],
            tasks: vec![missed_task, due_soon_task],
        }
    }

    /// One missed-deadline reconciliation pass.
    ///
    /// Re-scans ALL pending activities every tick; the conditional write
    /// makes the rescan idempotent, so no incremental tracking is needed.
    /// Returns the number of committed transitions.
    pub async fn check_missed(&self) -> Result<usize> {
        let now = Utc::now();
        let pending = self.store.list_by_status(ActivityStatus::Pending).await?;

        let mut transitioned: Vec<Activity> = Vec::new();
        for mut activity in pending {
            if !activity.is_overdue(now) {
                continue;
            }
            activity.status = ActivityStatus::Missed;
            match self.store.update_if_pending(activity.clone()).await {
                Ok(true) => transitioned.push(activity),
                // Lost the race to a concurrent complete/delete; the
                // stale Missed must not overwrite that outcome.
                Ok(false) => debug!("Activity {} mutated concurrently, not marking missed", activity.id),
                Err(e) => warn!("Failed to mark activity {} missed: {}", activity.id, e),
            }
        }

        if transitioned.is_empty() {
            return Ok(0);
        }

        info!("Marked {} overdue activities as missed", transitioned.len());
        // Persistence first, notification second: events go out only for
        // transitions that committed.
        for activity in &transitioned {
            self.bus
                .publish(ActivityEvent::for_activity(EventKind::Missed, activity))
                .await;
        }

        Ok(transitioned.len())
    }

    /// One due-soon reconciliation pass.
    ///
    /// The `reminded` flag is committed before the event is published, so
    /// the same deadline never notifies twice; a crash between commit and
    /// publish loses at most that one notification.
    pub async fn check_due_soon(&self) -> Result<usize> {
        let now = Utc::now();
        let pending = self.store.list_by_status(ActivityStatus::Pending).await?;

        let mut reminded: Vec<Activity> = Vec::new();
        for mut activity in pending {
            if !activity.is_due_soon(now) {
                continue;
            }
            activity.reminded = true;
            match self.store.update_if_pending(activity.clone()).await {
                Ok(true) => reminded.push(activity),
                Ok(false) => debug!("Activity {} mutated concurrently, skipping reminder", activity.id),
                Err(e) => warn!("Failed to set reminder flag on {}: {}", activity.id, e),
            }
        }

        if reminded.is_empty() {
            return Ok(0);
        }

        debug!("Publishing {} due-soon reminders", reminded.len());
        for activity in &reminded {
            self.bus.publish(ActivityEvent::due_soon(activity)).await;
        }

        Ok(reminded.len())
    }
}
