//! Synchronous activity mutations.
//!
//! These are the request-path state changes: create, update, complete,
//! snooze, delete. Each commits to the store first and publishes its
//! event to the bus afterward, making it an equal-peer publisher next to
//! the scheduler.

use crate::activity::{clamp_notification_minutes, Activity, ActivityStatus, RecurrencePattern};
use crate::events::{ActivityEvent, EventBus, EventKind};
use crate::store::ActivityStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain errors for mutation operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MutationError {
    /// No activity with the given id.
    NotFound { id: Uuid },
    /// The activity is in a terminal state and cannot transition.
    InvalidState { id: Uuid, status: ActivityStatus },
}

impl std::fmt::Display for MutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationError::NotFound { id } => write!(f, "Activity not found: {}", id),
            MutationError::InvalidState { id, status } => {
                write!(f, "Activity {} is {} and cannot transition", id, status)
            }
        }
    }
}

impl std::error::Error for MutationError {}

/// Input for creating an activity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewActivity {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub category: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub notification_minutes: Option<i64>,
    pub recurrence: Option<RecurrencePattern>,
}

/// Creates a pending activity and publishes `created`.
pub async fn create(
    store: &Arc<dyn ActivityStore>,
    bus: &EventBus,
    input: NewActivity,
) -> Result<Activity> {
    let deadline = input
        .deadline
        .ok_or_else(|| anyhow::anyhow!("Activity deadline is required"))?;

    let mut activity = Activity::new(input.title, deadline);
    activity.description = input.description;
    activity.priority = input.priority;
    activity.category = input.category;
    if let Some(minutes) = input.notification_minutes {
        activity.notification_minutes = clamp_notification_minutes(minutes);
    }
    if let Some(pattern) = input.recurrence {
        activity.is_recurring = true;
        activity.recurrence_pattern = Some(pattern);
    }

    store.insert(activity.clone()).await?;
    bus.publish(ActivityEvent::for_activity(EventKind::Created, &activity))
        .await;
    info!("Created activity {} ({})", activity.id, activity.title);
    Ok(activity)
}

/// Field changes applied by [`update`]. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub category: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub notification_minutes: Option<i64>,
}

/// Applies field updates to an activity and publishes `updated`.
pub async fn update(
    store: &Arc<dyn ActivityStore>,
    bus: &EventBus,
    id: Uuid,
    changes: ActivityChanges,
) -> Result<Activity> {
    let mut activity = store
        .get(id)
        .await?
        .ok_or(MutationError::NotFound { id })?;

    if let Some(title) = changes.title {
        activity.title = title;
    }
    if let Some(description) = changes.description {
        activity.description = Some(description);
    }
    if let Some(priority) = changes.priority {
        activity.priority = Some(priority);
    }
    if let Some(category) = changes.category {
        activity.category = Some(category);
    }
    if let Some(deadline) = changes.deadline {
        activity.deadline = deadline;
    }
    if let Some(minutes) = changes.notification_minutes {
        activity.notification_minutes = clamp_notification_minutes(minutes);
    }

    store.update(activity.clone()).await?;
    bus.publish(ActivityEvent::for_activity(EventKind::Updated, &activity))
        .await;
    Ok(activity)
}

/// Completes a pending activity, publishes `completed`, and expands the
/// next occurrence for recurring activities.
///
/// The expansion is best-effort-sequential: a failure to insert the
/// successor never rolls back the completion, it is only logged.
pub async fn complete(
    store: &Arc<dyn ActivityStore>,
    bus: &EventBus,
    id: Uuid,
) -> Result<Activity> {
    let mut activity = store
        .get(id)
        .await?
        .ok_or(MutationError::NotFound { id })?;

    if !activity.is_pending() {
        return Err(MutationError::InvalidState {
            id,
            status: activity.status,
        }
        .into());
    }

    activity.status = ActivityStatus::Completed;
    activity.completed_at = Some(Utc::now());
    store.update(activity.clone()).await?;
    bus.publish(ActivityEvent::for_activity(EventKind::Completed, &activity))
        .await;
    info!("Completed activity {} ({})", activity.id, activity.title);

    if let Some(next) = activity.next_occurrence() {
        match store.insert(next.clone()).await {
            Ok(()) => {
                bus.publish(ActivityEvent::for_activity(EventKind::Created, &next))
                    .await;
                info!(
                    "Spawned next {} occurrence {} due {}",
                    next.recurrence_pattern
                        .map(|p| p.to_string())
                        .unwrap_or_default(),
                    next.id,
                    next.deadline
                );
            }
            Err(e) => {
                warn!("Failed to spawn next occurrence of {}: {}", activity.id, e);
            }
        }
    }

    Ok(activity)
}

/// Snoozes due-soon reminders until the given time and publishes
/// `snoozed`.
///
/// Re-arms exactly one further notification by clearing the `reminded`
/// flag; the deadline and status are untouched, so the activity can still
/// go missed while snoozed.
pub async fn snooze(
    store: &Arc<dyn ActivityStore>,
    bus: &EventBus,
    id: Uuid,
    until: DateTime<Utc>,
) -> Result<Activity> {
    let mut activity = store
        .get(id)
        .await?
        .ok_or(MutationError::NotFound { id })?;

    if !activity.is_pending() {
        return Err(MutationError::InvalidState {
            id,
            status: activity.status,
        }
        .into());
    }

    activity.snoozed_until = Some(until);
    activity.reminded = false;
    store.update(activity.clone()).await?;
    bus.publish(ActivityEvent::for_activity(EventKind::Snoozed, &activity))
        .await;
    Ok(activity)
}

/// Deletes an activity; publishes `deleted` only when a record existed.
pub async fn delete(store: &Arc<dyn ActivityStore>, bus: &EventBus, id: Uuid) -> Result<bool> {
    let removed = store.delete(id).await?;
    if removed {
        bus.publish(ActivityEvent::deleted(id)).await;
        info!("Deleted activity {}", id);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn temp_store(dir: &tempfile::TempDir) -> Arc<dyn ActivityStore> {
        Arc::new(FileStore::open(dir.path().join("activities.json"), chrono_tz::UTC).unwrap())
    }

    /// Store that rejects inserts while the flag is set.
    struct RejectingInsertStore {
        inner: FileStore,
        reject_inserts: AtomicBool,
    }

    #[async_trait]
    impl ActivityStore for RejectingInsertStore {
        async fn list_by_status(&self, status: ActivityStatus) -> Result<Vec<Activity>> {
            self.inner.list_by_status(status).await
        }

        async fn list_all(&self) -> Result<Vec<Activity>> {
            self.inner.list_all().await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Activity>> {
            self.inner.get(id).await
        }

        async fn insert(&self, activity: Activity) -> Result<()> {
            if self.reject_inserts.load(Ordering::SeqCst) {
                anyhow::bail!("no space left on device");
            }
            self.inner.insert(activity).await
        }

        async fn update(&self, activity: Activity) -> Result<()> {
            self.inner.update(activity).await
        }

        async fn update_if_pending(&self, activity: Activity) -> Result<bool> {
            self.inner.update_if_pending(activity).await
        }

        async fn delete(&self, id: Uuid) -> Result<bool> {
            self.inner.delete(id).await
        }
    }

    fn new_input(title: &str, deadline: DateTime<Utc>) -> NewActivity {
        NewActivity {
            title: title.to_string(),
            deadline: Some(deadline),
            ..NewActivity::default()
        }
    }

    #[tokio::test]
    async fn test_create_publishes_created_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;

        let activity = create(&store, &bus, new_input("plan", Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.payload["id"], serde_json::json!(activity.id));
        assert_eq!(activity.status, ActivityStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_without_deadline_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let bus = EventBus::new();

        let result = create(
            &store,
            &bus,
            NewActivity {
                title: "no deadline".to_string(),
                ..NewActivity::default()
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_create_clamps_notification_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let bus = EventBus::new();

        let mut input = new_input("clamped", Utc::now() + Duration::hours(1));
        input.notification_minutes = Some(2);
        let activity = create(&store, &bus, input).await.unwrap();
        assert_eq!(activity.notification_minutes, 5);
    }

    #[tokio::test]
    async fn test_complete_is_one_way() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let bus = EventBus::new();

        let activity = create(&store, &bus, new_input("once", Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        let completed = complete(&store, &bus, activity.id).await.unwrap();
        assert_eq!(completed.status, ActivityStatus::Completed);
        assert!(completed.completed_at.is_some());

        // No resurrection, no double completion.
        let again = complete(&store, &bus, activity.id).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_complete_recurring_daily_spawns_successor() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;

        let deadline = Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap();
        let mut input = new_input("daily standup", deadline);
        input.recurrence = Some(RecurrencePattern::Daily);
        let activity = create(&store, &bus, input).await.unwrap();
        let _created = sub.recv().await.unwrap();

        complete(&store, &bus, activity.id).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Completed);
        let spawn_event = sub.recv().await.unwrap();
        assert_eq!(spawn_event.kind, EventKind::Created);

        let pending = store.list_by_status(ActivityStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].deadline,
            Utc.with_ymd_and_hms(2024, 1, 11, 9, 0, 0).unwrap()
        );
        assert_eq!(pending[0].title, "daily standup");
        assert!(pending[0].is_recurring);
    }

    #[tokio::test]
    async fn test_failed_successor_insert_keeps_completion() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(RejectingInsertStore {
            inner: FileStore::open(dir.path().join("activities.json"), chrono_tz::UTC).unwrap(),
            reject_inserts: AtomicBool::new(false),
        });
        let store = Arc::clone(&flaky) as Arc<dyn ActivityStore>;
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;

        let mut input = new_input("weekly report", Utc::now() + Duration::hours(1));
        input.recurrence = Some(RecurrencePattern::Weekly);
        let activity = create(&store, &bus, input).await.unwrap();
        let _created = sub.recv().await.unwrap();

        // The successor insert fails; the completion must stand.
        flaky.reject_inserts.store(true, Ordering::SeqCst);
        let completed = complete(&store, &bus, activity.id).await.unwrap();
        assert_eq!(completed.status, ActivityStatus::Completed);
        assert!(completed.completed_at.is_some());

        let stored = store.get(activity.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ActivityStatus::Completed);
        assert!(store
            .list_by_status(ActivityStatus::Pending)
            .await
            .unwrap()
            .is_empty());

        // One completed event, no created event for the lost successor.
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Completed);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_snooze_resets_reminder_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let bus = EventBus::new();

        let activity = create(&store, &bus, new_input("nap", Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        // Simulate a fired reminder.
        let mut fired = store.get(activity.id).await.unwrap().unwrap();
        fired.reminded = true;
        store.update(fired).await.unwrap();

        let until = Utc::now() + Duration::minutes(30);
        let snoozed = snooze(&store, &bus, activity.id, until).await.unwrap();
        assert!(!snoozed.reminded);
        assert_eq!(snoozed.snoozed_until, Some(until));
        assert_eq!(snoozed.status, ActivityStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_changes_fields_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;

        let activity = create(&store, &bus, new_input("old title", Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        let _created = sub.recv().await.unwrap();

        let changes = ActivityChanges {
            title: Some("new title".to_string()),
            notification_minutes: Some(10_000),
            ..ActivityChanges::default()
        };
        let updated = update(&store, &bus, activity.id, changes).await.unwrap();
        assert_eq!(updated.title, "new title");
        assert_eq!(updated.notification_minutes, 1440);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Updated);
    }

    #[tokio::test]
    async fn test_delete_publishes_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;

        let activity = create(&store, &bus, new_input("gone", Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        let _created = sub.recv().await.unwrap();

        assert!(delete(&store, &bus, activity.id).await.unwrap());
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Deleted);

        assert!(!delete(&store, &bus, activity.id).await.unwrap());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_mutation_error_display() {
        let id = Uuid::new_v4();
        let err = MutationError::InvalidState {
            id,
            status: ActivityStatus::Missed,
        };
        assert!(err.to_string().contains("missed"));
        let err = MutationError::NotFound { id };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
