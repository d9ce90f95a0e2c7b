//! Activity domain model.
//!
//! An activity is a user-defined obligation with a deadline. Its lifecycle
//! is reconciled against wall-clock time by the scheduler: a pending
//! activity becomes `Missed` once its deadline passes, and gets a one-time
//! due-soon reminder once the deadline is closer than its notification
//! lead time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default due-soon lead time (minutes) for new activities.
pub const DEFAULT_NOTIFICATION_MINUTES: i64 = 30;

/// Lower bound for the due-soon lead time (minutes).
pub const MIN_NOTIFICATION_MINUTES: i64 = 5;

/// Upper bound for the due-soon lead time (minutes).
pub const MAX_NOTIFICATION_MINUTES: i64 = 1440;

/// Lifecycle state of an activity.
///
/// `Pending` is the initial state. `Completed` and `Missed` are terminal:
/// once left, `Pending` is never re-entered and neither scheduler check
/// considers the record again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    #[default]
    Pending,
    Completed,
    Missed,
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityStatus::Pending => write!(f, "pending"),
            ActivityStatus::Completed => write!(f, "completed"),
            ActivityStatus::Missed => write!(f, "missed"),
        }
    }
}

/// Recurrence cadence for repeating activities.
///
/// Periods are fixed increments, anchored to the previous deadline.
/// `Monthly` is a flat 30 days, not a calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Monthly,
}

impl RecurrencePattern {
    /// Returns the fixed period this pattern advances a deadline by.
    pub fn period(&self) -> Duration {
        match self {
            RecurrencePattern::Daily => Duration::days(1),
            RecurrencePattern::Weekly => Duration::days(7),
            RecurrencePattern::Monthly => Duration::days(30),
        }
    }
}

impl std::fmt::Display for RecurrencePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecurrencePattern::Daily => write!(f, "daily"),
            RecurrencePattern::Weekly => write!(f, "weekly"),
            RecurrencePattern::Monthly => write!(f, "monthly"),
        }
    }
}

/// A tracked activity.
///
/// All timestamps are UTC in memory; naive input is normalized to the
/// configured reference timezone at the store boundary, never inside
/// comparison logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub status: ActivityStatus,
    /// True once a due-soon reminder has fired for this record.
    /// Only a snooze resets it.
    #[serde(default)]
    pub reminded: bool,
    /// While set and in the future, the activity is exempt from due-soon
    /// reminders. Does NOT exempt it from the missed-deadline transition.
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
    /// Due-soon lead time before the deadline, minutes. Bounded 5-1440.
    #[serde(default = "default_notification_minutes")]
    pub notification_minutes: i64,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurrence_pattern: Option<RecurrencePattern>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_notification_minutes() -> i64 {
    DEFAULT_NOTIFICATION_MINUTES
}

/// Clamps a due-soon lead time to the supported 5-1440 minute range.
pub fn clamp_notification_minutes(minutes: i64) -> i64 {
    minutes.clamp(MIN_NOTIFICATION_MINUTES, MAX_NOTIFICATION_MINUTES)
}

impl Activity {
    /// Creates a new pending activity with a fresh id and defaults.
    pub fn new(title: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            priority: None,
            category: None,
            deadline,
            status: ActivityStatus::Pending,
            reminded: false,
            snoozed_until: None,
            notification_minutes: DEFAULT_NOTIFICATION_MINUTES,
            is_recurring: false,
            recurrence_pattern: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// True while the record still accepts lifecycle transitions.
    pub fn is_pending(&self) -> bool {
        self.status == ActivityStatus::Pending
    }

    /// Pending and past its deadline at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.deadline < now
    }

    /// True while a snooze is active at `now`.
    pub fn is_snoozed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.snoozed_until, Some(until) if until > now)
    }

    /// Pending, unreminded, unsnoozed, and inside the due-soon window:
    /// `now < deadline <= now + notification_minutes`.
    pub fn is_due_soon(&self, now: DateTime<Utc>) -> bool {
        if !self.is_pending() || self.reminded || self.is_snoozed(now) {
            return false;
        }
        let threshold =
            now + Duration::minutes(clamp_notification_minutes(self.notification_minutes));
        now < self.deadline && self.deadline <= threshold
    }

    /// Builds the successor occurrence for a recurring activity.
    ///
    /// The new record is a fresh pending clone (new id, reminder cleared,
    /// snooze cleared) with the deadline advanced by exactly one period
    /// from the original deadline, not from now. Returns `None` for
    /// non-recurring activities.
    pub fn next_occurrence(&self) -> Option<Activity> {
        if !self.is_recurring {
            return None;
        }
        let pattern = self.recurrence_pattern?;
        Some(Activity {
            id: Uuid::new_v4(),
            title: self.title.clone(),
            description: self.description.clone(),
            priority: self.priority.clone(),
            category: self.category.clone(),
            deadline: self.deadline + pattern.period(),
            status: ActivityStatus::Pending,
            reminded: false,
            snoozed_until: None,
            notification_minutes: self.notification_minutes,
            is_recurring: true,
            recurrence_pattern: Some(pattern),
            created_at: Utc::now(),
            completed_at: None,
        })
    }
}
