//! Task and family member domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Expired,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Priority assigned to a task by a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

/// Category of a task, used for grouping in the UI and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Chore,
    Homework,
    Hygiene,
    Exercise,
    Other,
}

/// A concrete task assigned to a child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    pub id: Uuid,
    pub family_id: Uuid,
    pub title: String,
    pub category: TaskCategory,
    /// The child this task is assigned to.
    pub assigned_to: Uuid,
    pub points: i64,
    /// Whether completion requires a photo proof submission.
    pub requires_photo: bool,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Denormalized current escalation level (0 = not escalated).
    #[serde(default)]
    pub escalation_level: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether the task is still awaiting completion.
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// Hours elapsed since the due date, if the task is pending and overdue.
    ///
    /// Returns `None` for tasks without a due date, tasks not yet due, and
    /// tasks no longer pending.
    pub fn hours_overdue(&self, now: DateTime<Utc>) -> Option<f64> {
        if !self.is_pending() {
            return None;
        }
        let due = self.due_at?;
        if now <= due {
            return None;
        }
        Some((now - due).num_seconds() as f64 / 3600.0)
    }
}

/// Role of a family member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyRole {
    Parent,
    Child,
}

/// A member of a family: a parent or a child.
///
/// Children carry a cached point total and streak counter; both roles may
/// have a registered push device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FamilyMember {
    pub id: Uuid,
    pub family_id: Uuid,
    pub display_name: String,
    pub role: FamilyRole,
    /// Cached point total. Maintained by ledger writes, floored at zero.
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub current_streak: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

/// An append-only point ledger entry for a child.
///
/// Task completions append positive entries; escalation point penalties
/// append negative ones. The cached total on [`FamilyMember`] is derived
/// from these and never goes below zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PointLedgerEntry {
    pub id: Uuid,
    pub child_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub delta: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task_due_at(due: Option<DateTime<Utc>>, status: TaskStatus) -> Task {
        Task {
            id: Uuid::new_v4(),
            family_id: Uuid::new_v4(),
            title: "Take out trash".to_string(),
            category: TaskCategory::Chore,
            assigned_to: Uuid::new_v4(),
            points: 10,
            requires_photo: false,
            priority: TaskPriority::Medium,
            status,
            due_at: due,
            escalation_level: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_hours_overdue_pending_past_due() {
        let due = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();
        let task = task_due_at(Some(due), TaskStatus::Pending);
        let hours = task.hours_overdue(now).unwrap();
        assert!((hours - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hours_overdue_not_yet_due() {
        let due = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let task = task_due_at(Some(due), TaskStatus::Pending);
        assert!(task.hours_overdue(now).is_none());
    }

    #[test]
    fn test_hours_overdue_completed_task() {
        let due = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        let task = task_due_at(Some(due), TaskStatus::Completed);
        assert!(task.hours_overdue(now).is_none());
    }

    #[test]
    fn test_hours_overdue_no_due_date() {
        let task = task_due_at(None, TaskStatus::Pending);
        assert!(task.hours_overdue(Utc::now()).is_none());
    }

    #[test]
    fn test_task_round_trips_through_json() {
        let due = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let task = task_due_at(Some(due), TaskStatus::Pending);
        let json = serde_json::to_value(&task).unwrap();
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.due_at, task.due_at);
        assert_eq!(back.status, TaskStatus::Pending);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::Completed.to_string(), "completed");
        assert_eq!(TaskStatus::Expired.to_string(), "expired");
    }
}
