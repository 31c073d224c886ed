//! Escalation ladder configuration and per-task escalation records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::notification::Severity;

/// Action executed when a task reaches an escalation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    NotifyChild,
    NotifyParent,
    NotifyBoth,
    ReducePoints,
    RestrictDevice,
}

impl std::fmt::Display for EscalationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationAction::NotifyChild => "notify_child",
            EscalationAction::NotifyParent => "notify_parent",
            EscalationAction::NotifyBoth => "notify_both",
            EscalationAction::ReducePoints => "reduce_points",
            EscalationAction::RestrictDevice => "restrict_device",
        };
        write!(f, "{}", s)
    }
}

/// Device capability removed while a restriction is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictedCapability {
    TaskCreation,
    RewardsVisibility,
    GameTime,
}

/// One tier of the escalation ladder.
///
/// Levels are ordered by ascending `hours_overdue`; level numbers start
/// at 1 (0 is the implicit "not escalated" state).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EscalationLevel {
    pub level: u32,
    pub name: String,
    /// Hours a pending task must be overdue before this level triggers.
    pub hours_overdue: f64,
    pub actions: Vec<EscalationAction>,
    pub severity: Severity,
    /// Points deducted by a `ReducePoints` action at this level.
    #[serde(default)]
    pub point_penalty: i64,
    /// Capabilities removed by a `RestrictDevice` action at this level.
    #[serde(default)]
    pub restricted_capabilities: Vec<RestrictedCapability>,
    pub message_template: String,
}

/// The built-in four-level ladder at 1/3/6/24 hours overdue.
pub fn default_levels() -> Vec<EscalationLevel> {
    vec![
        EscalationLevel {
            level: 1,
            name: "Gentle nudge".to_string(),
            hours_overdue: 1.0,
            actions: vec![EscalationAction::NotifyChild],
            severity: Severity::Medium,
            point_penalty: 0,
            restricted_capabilities: vec![],
            message_template:
                "Hey {childName}! \"{taskTitle}\" was due {hours} hours ago. You can still do it!"
                    .to_string(),
        },
        EscalationLevel {
            level: 2,
            name: "Firm reminder".to_string(),
            hours_overdue: 3.0,
            actions: vec![EscalationAction::NotifyBoth],
            severity: Severity::High,
            point_penalty: 0,
            restricted_capabilities: vec![],
            message_template:
                "\"{taskTitle}\" is now {hours} hours overdue. Time to get it done, {childName}."
                    .to_string(),
        },
        EscalationLevel {
            level: 3,
            name: "Parent alert".to_string(),
            hours_overdue: 6.0,
            actions: vec![
                EscalationAction::NotifyParent,
                EscalationAction::ReducePoints,
            ],
            severity: Severity::High,
            point_penalty: 5,
            restricted_capabilities: vec![],
            message_template:
                "{childName} has not done \"{taskTitle}\" for {hours} hours. 5 points deducted."
                    .to_string(),
        },
        EscalationLevel {
            level: 4,
            name: "Intervention".to_string(),
            hours_overdue: 24.0,
            actions: vec![
                EscalationAction::NotifyBoth,
                EscalationAction::ReducePoints,
                EscalationAction::RestrictDevice,
            ],
            severity: Severity::Critical,
            point_penalty: 10,
            restricted_capabilities: vec![
                RestrictedCapability::TaskCreation,
                RestrictedCapability::RewardsVisibility,
            ],
            message_template:
                "\"{taskTitle}\" has been ignored for {hours} hours. App features restricted."
                    .to_string(),
        },
    ]
}

/// One level transition for one task.
///
/// A new record is written per level reached; records are never deleted.
/// All unresolved records for a task resolve together when the task
/// completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EscalationRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub child_id: Uuid,
    pub family_id: Uuid,
    pub level: u32,
    pub actions_taken: Vec<EscalationAction>,
    pub escalated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Duration a device restriction stays active unless lifted earlier.
pub const RESTRICTION_TTL_HOURS: i64 = 24;

/// An active device restriction caused by a `RestrictDevice` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeviceRestriction {
    pub id: Uuid,
    pub child_id: Uuid,
    pub task_id: Uuid,
    pub capabilities: Vec<RestrictedCapability>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set when escalation resolution lifts the restriction early.
    #[serde(default)]
    pub lifted: bool,
}

impl DeviceRestriction {
    pub fn new(
        child_id: Uuid,
        task_id: Uuid,
        capabilities: Vec<RestrictedCapability>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            child_id,
            task_id,
            capabilities,
            created_at: now,
            expires_at: now + Duration::hours(RESTRICTION_TTL_HOURS),
            lifted: false,
        }
    }

    /// Whether the restriction still applies. Expiry is checked lazily at
    /// read time; the record is not rewritten when it lapses.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.lifted && now < self.expires_at
    }
}
