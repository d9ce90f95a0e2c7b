//! Activity persistence.
//!
//! The daemon holds its registry of activities in memory and snapshots it
//! to a JSON file, loading it back on start. All timestamps are normalized
//! at this boundary: the snapshot may contain RFC3339 timestamps or naive
//! ones (assumed to be in the configured reference timezone), but every
//! record handed out of the store carries UTC. Comparison logic elsewhere
//! never sees a timezone.

use crate::activity::{Activity, ActivityStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Data-access contract consumed by the scheduler and mutation operations.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Returns all activities with the given status.
    async fn list_by_status(&self, status: ActivityStatus) -> Result<Vec<Activity>>;

    /// Returns every stored activity.
    async fn list_all(&self) -> Result<Vec<Activity>>;

    /// Looks up a single activity.
    async fn get(&self, id: Uuid) -> Result<Option<Activity>>;

    /// Inserts a new activity. Errors if the id already exists.
    async fn insert(&self, activity: Activity) -> Result<()>;

    /// Full-record replace. Errors if the activity does not exist.
    async fn update(&self, activity: Activity) -> Result<()>;

    /// Conditional write used by the scheduler: commits only while the
    /// stored record is still `Pending`, so a stale scan result never
    /// overwrites a concurrent complete/delete. Returns whether the write
    /// was applied.
    async fn update_if_pending(&self, activity: Activity) -> Result<bool>;

    /// Removes an activity. Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// On-disk activity record.
///
/// Timestamps are strings so older snapshots with naive local timestamps
/// still load; [`FileStore`] normalizes them to UTC on read and always
/// writes RFC3339 UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredActivity {
    id: Uuid,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    category: Option<String>,
    deadline: String,
    #[serde(default)]
    status: ActivityStatus,
    #[serde(default)]
    reminded: bool,
    #[serde(default)]
    snoozed_until: Option<String>,
    #[serde(default = "default_notification_minutes")]
    notification_minutes: i64,
    #[serde(default)]
    is_recurring: bool,
    #[serde(default)]
    recurrence_pattern: Option<crate::activity::RecurrencePattern>,
    created_at: String,
    #[serde(default)]
    completed_at: Option<String>,
}

fn default_notification_minutes() -> i64 {
    crate::activity::DEFAULT_NOTIFICATION_MINUTES
}

/// Parses a timestamp from storage or user input, normalizing naive
/// values through the reference timezone.
pub fn parse_timestamp(raw: &str, reference_tz: Tz) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("Unrecognized timestamp format: {}", raw))?;

    match reference_tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        // DST fold: take the earlier instant
        chrono::LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
        chrono::LocalResult::None => {
            anyhow::bail!("Timestamp {} does not exist in timezone {}", raw, reference_tz)
        }
    }
}

impl StoredActivity {
    fn from_activity(activity: &Activity) -> Self {
        Self {
            id: activity.id,
            title: activity.title.clone(),
            description: activity.description.clone(),
            priority: activity.priority.clone(),
            category: activity.category.clone(),
            deadline: activity.deadline.to_rfc3339(),
            status: activity.status,
            reminded: activity.reminded,
            snoozed_until: activity.snoozed_until.map(|t| t.to_rfc3339()),
            notification_minutes: activity.notification_minutes,
            is_recurring: activity.is_recurring,
            recurrence_pattern: activity.recurrence_pattern,
            created_at: activity.created_at.to_rfc3339(),
            completed_at: activity.completed_at.map(|t| t.to_rfc3339()),
        }
    }

    fn into_activity(self, reference_tz: Tz) -> Result<Activity> {
        let snoozed_until = match &self.snoozed_until {
            Some(raw) => Some(parse_timestamp(raw, reference_tz)?),
            None => None,
        };
        let completed_at = match &self.completed_at {
            Some(raw) => Some(parse_timestamp(raw, reference_tz)?),
            None => None,
        };
        Ok(Activity {
            id: self.id,
            title: self.title,
            description: self.description,
            priority: self.priority,
            category: self.category,
            deadline: parse_timestamp(&self.deadline, reference_tz)?,
            status: self.status,
            reminded: self.reminded,
            snoozed_until,
            notification_minutes: crate::activity::clamp_notification_minutes(
                self.notification_minutes,
            ),
            is_recurring: self.is_recurring,
            recurrence_pattern: self.recurrence_pattern,
            created_at: parse_timestamp(&self.created_at, reference_tz)?,
            completed_at,
        })
    }
}

/// JSON-file-backed activity store.
///
/// Registry lives in memory; every successful mutation snapshots the whole
/// map to disk (temp file + rename, so a crash mid-write never corrupts
/// the snapshot).
pub struct FileStore {
    activities: Mutex<HashMap<Uuid, Activity>>,
    path: PathBuf,
}

impl FileStore {
    /// Opens (or creates) a store at `path`. A missing snapshot file is an
    /// empty store; a record that fails to parse is skipped with a warning
    /// rather than failing the load.
    pub fn open(path: PathBuf, reference_tz: Tz) -> Result<Self> {
        let mut activities = HashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read activity snapshot: {}", path.display()))?;
            let records: Vec<StoredActivity> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse activity snapshot: {}", path.display()))?;

            for record in records {
                let id = record.id;
                match record.into_activity(reference_tz) {
                    Ok(activity) => {
                        activities.insert(activity.id, activity);
                    }
                    Err(e) => {
                        tracing::warn!("Skipping unparseable activity {}: {}", id, e);
                    }
                }
            }
        }

        Ok(Self {
            activities: Mutex::new(activities),
            path,
        })
    }

    /// Snapshots the registry to disk. Called with the registry lock held.
    fn persist(&self, activities: &HashMap<Uuid, Activity>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory: {}", parent.display())
            })?;
        }

        let mut records: Vec<StoredActivity> =
            activities.values().map(StoredActivity::from_activity).collect();
        records.sort_by_key(|r| r.created_at.clone());

        let content =
            serde_json::to_string_pretty(&records).context("Failed to serialize activities")?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)
            .with_context(|| format!("Failed to write temp snapshot: {}", temp_path.display()))?;
        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename snapshot to: {}", self.path.display()))?;

        Ok(())
    }
}

#[async_trait]
impl ActivityStore for FileStore {
    async fn list_by_status(&self, status: ActivityStatus) -> Result<Vec<Activity>> {
        let activities = self.activities.lock().await;
        let mut matching: Vec<Activity> = activities
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|a| a.deadline);
        Ok(matching)
    }

    async fn list_all(&self) -> Result<Vec<Activity>> {
        let activities = self.activities.lock().await;
        let mut all: Vec<Activity> = activities.values().cloned().collect();
        all.sort_by_key(|a| a.deadline);
        Ok(all)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Activity>> {
        let activities = self.activities.lock().await;
        Ok(activities.get(&id).cloned())
    }

    async fn insert(&self, activity: Activity) -> Result<()> {
        let mut activities = self.activities.lock().await;
        if activities.contains_key(&activity.id) {
            anyhow::bail!("Activity already exists: {}", activity.id);
        }
        activities.insert(activity.id, activity);
        self.persist(&activities)
    }

    async fn update(&self, activity: Activity) -> Result<()> {
        let mut activities = self.activities.lock().await;
        if !activities.contains_key(&activity.id) {
            anyhow::bail!("Activity not found: {}", activity.id);
        }
        activities.insert(activity.id, activity);
        self.persist(&activities)
    }

    async fn update_if_pending(&self, activity: Activity) -> Result<bool> {
        let mut activities = self.activities.lock().await;
        match activities.get(&activity.id) {
            Some(existing) if existing.is_pending() => {
                activities.insert(activity.id, activity);
                self.persist(&activities)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut activities = self.activities.lock().await;
        if activities.remove(&id).is_none() {
            return Ok(false);
        }
        self.persist(&activities)?;
        Ok(true)
    }
}
