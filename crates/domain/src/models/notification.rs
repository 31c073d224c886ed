//! Notification rules, events, and queue entry models.
//!
//! Events are a tagged union over the known lifecycle event kinds; each
//! variant carries exactly the fields its message templates need. Queue
//! entries are keyed by the (event, recipient) composite key so re-admission
//! of the same occurrence is an upsert, not a duplicate.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of lifecycle event a notification rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskCompleted,
    TaskOverdue,
    TaskReminder,
    PhotoSubmitted,
    PhotoApproved,
    PhotoRejected,
    StreakMilestone,
    Escalation,
    HabitFormed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::TaskCreated => "task_created",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskOverdue => "task_overdue",
            EventKind::TaskReminder => "task_reminder",
            EventKind::PhotoSubmitted => "photo_submitted",
            EventKind::PhotoApproved => "photo_approved",
            EventKind::PhotoRejected => "photo_rejected",
            EventKind::StreakMilestone => "streak_milestone",
            EventKind::Escalation => "escalation",
            EventKind::HabitFormed => "habit_formed",
        };
        write!(f, "{}", s)
    }
}

/// Notification severity. Ordering matters: `Critical` bypasses rate
/// limiting and grouping.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Which family roles a rule notifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientRole {
    Child,
    Parent,
    Both,
}

/// Optional gating conditions on a notification rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriggerConditions {
    /// Minimum streak length (streak / habit rules).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_streak: Option<u32>,
    /// Minimum hours a task must be overdue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_hours_overdue: Option<f64>,
    /// Only fire while the child's rolling completion rate is at or below
    /// this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_rate: Option<f64>,
}

/// Context evaluated against [`TriggerConditions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerContext {
    pub streak: Option<u32>,
    pub hours_overdue: Option<f64>,
    pub completion_rate: Option<f64>,
}

impl TriggerConditions {
    /// Whether all present conditions are satisfied by the context.
    ///
    /// A condition whose context value is unknown counts as unsatisfied.
    pub fn satisfied(&self, ctx: &TriggerContext) -> bool {
        if let Some(min) = self.min_streak {
            if ctx.streak.map_or(true, |s| s < min) {
                return false;
            }
        }
        if let Some(min) = self.min_hours_overdue {
            if ctx.hours_overdue.map_or(true, |h| h < min) {
                return false;
            }
        }
        if let Some(max) = self.max_completion_rate {
            if ctx.completion_rate.map_or(true, |r| r > max) {
                return false;
            }
        }
        true
    }
}

/// A rule describing how a lifecycle event turns into a notification.
///
/// Immutable once resolved for a given event occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotificationRule {
    pub id: Uuid,
    pub kind: EventKind,
    pub severity: Severity,
    pub recipients: RecipientRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<TriggerConditions>,
    pub title_template: String,
    pub body_template: String,
}

impl NotificationRule {
    fn new(
        kind: EventKind,
        severity: Severity,
        recipients: RecipientRole,
        title: &str,
        body: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            recipients,
            conditions: None,
            title_template: title.to_string(),
            body_template: body.to_string(),
        }
    }
}

/// Built-in rule set used when no stored rule matches an event kind.
pub fn default_rules() -> Vec<NotificationRule> {
    vec![
        NotificationRule::new(
            EventKind::TaskCreated,
            Severity::Low,
            RecipientRole::Child,
            "New task",
            "{childName}, you have a new task: {taskTitle}",
        ),
        NotificationRule::new(
            EventKind::TaskCompleted,
            Severity::Low,
            RecipientRole::Parent,
            "Task completed",
            "{childName} completed \"{taskTitle}\" and earned {points} points",
        ),
        NotificationRule::new(
            EventKind::TaskOverdue,
            Severity::Medium,
            RecipientRole::Both,
            "Task overdue",
            "\"{taskTitle}\" is {hours} hours overdue",
        ),
        NotificationRule::new(
            EventKind::TaskReminder,
            Severity::Medium,
            RecipientRole::Child,
            "Reminder",
            "{message}",
        ),
        NotificationRule::new(
            EventKind::PhotoSubmitted,
            Severity::Medium,
            RecipientRole::Parent,
            "Photo to review",
            "{childName} submitted a photo for \"{taskTitle}\"",
        ),
        NotificationRule::new(
            EventKind::PhotoApproved,
            Severity::Low,
            RecipientRole::Child,
            "Photo approved",
            "Your photo for \"{taskTitle}\" was approved. +{points} points!",
        ),
        NotificationRule::new(
            EventKind::PhotoRejected,
            Severity::Medium,
            RecipientRole::Child,
            "Photo rejected",
            "Your photo for \"{taskTitle}\" was rejected. Please try again.",
        ),
        NotificationRule {
            conditions: Some(TriggerConditions {
                min_streak: Some(3),
                ..TriggerConditions::default()
            }),
            ..NotificationRule::new(
                EventKind::StreakMilestone,
                Severity::Low,
                RecipientRole::Both,
                "Streak milestone",
                "{childName} is on a {streak}-day streak!",
            )
        },
        NotificationRule::new(
            EventKind::Escalation,
            Severity::High,
            RecipientRole::Both,
            "Task needs attention",
            "\"{taskTitle}\" assigned to {childName} is {hours} hours overdue",
        ),
        NotificationRule {
            conditions: Some(TriggerConditions {
                min_streak: Some(21),
                ..TriggerConditions::default()
            }),
            ..NotificationRule::new(
                EventKind::HabitFormed,
                Severity::Low,
                RecipientRole::Both,
                "Habit formed",
                "{childName} turned \"{taskTitle}\" into a habit after {days} days",
            )
        },
    ]
}

/// A typed lifecycle event with exactly the payload its templates need.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    TaskCreated {
        task_id: Uuid,
        task_title: String,
        child_name: String,
    },
    TaskCompleted {
        task_id: Uuid,
        task_title: String,
        child_name: String,
        points: i64,
    },
    TaskOverdue {
        task_id: Uuid,
        task_title: String,
        child_name: String,
        hours: f64,
    },
    TaskReminder {
        task_id: Uuid,
        task_title: String,
        child_name: String,
        /// Index of this reminder within the task's schedule; distinct
        /// reminders for one task must not overwrite each other.
        sequence: u32,
        message: String,
    },
    PhotoSubmitted {
        task_id: Uuid,
        task_title: String,
        child_name: String,
    },
    PhotoApproved {
        task_id: Uuid,
        task_title: String,
        child_name: String,
        points: i64,
    },
    PhotoRejected {
        task_id: Uuid,
        task_title: String,
        child_name: String,
    },
    StreakMilestone {
        child_id: Uuid,
        child_name: String,
        days: u32,
    },
    Escalation {
        task_id: Uuid,
        task_title: String,
        child_name: String,
        level: u32,
        hours: f64,
    },
    HabitFormed {
        child_id: Uuid,
        child_name: String,
        task_title: String,
        days: u32,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NotificationEvent::TaskCreated { .. } => EventKind::TaskCreated,
            NotificationEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            NotificationEvent::TaskOverdue { .. } => EventKind::TaskOverdue,
            NotificationEvent::TaskReminder { .. } => EventKind::TaskReminder,
            NotificationEvent::PhotoSubmitted { .. } => EventKind::PhotoSubmitted,
            NotificationEvent::PhotoApproved { .. } => EventKind::PhotoApproved,
            NotificationEvent::PhotoRejected { .. } => EventKind::PhotoRejected,
            NotificationEvent::StreakMilestone { .. } => EventKind::StreakMilestone,
            NotificationEvent::Escalation { .. } => EventKind::Escalation,
            NotificationEvent::HabitFormed { .. } => EventKind::HabitFormed,
        }
    }

    /// Stable identifier for this event occurrence.
    ///
    /// Forms one half of the queue key: the same occurrence re-admitted for
    /// the same recipient overwrites the prior entry.
    pub fn event_id(&self) -> String {
        match self {
            NotificationEvent::TaskCreated { task_id, .. } => {
                format!("task_created:{}", task_id)
            }
            NotificationEvent::TaskCompleted { task_id, .. } => {
                format!("task_completed:{}", task_id)
            }
            NotificationEvent::TaskOverdue { task_id, .. } => {
                format!("task_overdue:{}", task_id)
            }
            NotificationEvent::TaskReminder {
                task_id, sequence, ..
            } => format!("task_reminder:{}:{}", task_id, sequence),
            NotificationEvent::PhotoSubmitted { task_id, .. } => {
                format!("photo_submitted:{}", task_id)
            }
            NotificationEvent::PhotoApproved { task_id, .. } => {
                format!("photo_approved:{}", task_id)
            }
            NotificationEvent::PhotoRejected { task_id, .. } => {
                format!("photo_rejected:{}", task_id)
            }
            NotificationEvent::StreakMilestone { child_id, days, .. } => {
                format!("streak:{}:{}", child_id, days)
            }
            NotificationEvent::Escalation { task_id, level, .. } => {
                format!("escalation:{}:{}", task_id, level)
            }
            NotificationEvent::HabitFormed { child_id, days, .. } => {
                format!("habit:{}:{}", child_id, days)
            }
        }
    }

    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            NotificationEvent::TaskCreated { task_id, .. }
            | NotificationEvent::TaskCompleted { task_id, .. }
            | NotificationEvent::TaskOverdue { task_id, .. }
            | NotificationEvent::TaskReminder { task_id, .. }
            | NotificationEvent::PhotoSubmitted { task_id, .. }
            | NotificationEvent::PhotoApproved { task_id, .. }
            | NotificationEvent::PhotoRejected { task_id, .. }
            | NotificationEvent::Escalation { task_id, .. } => Some(*task_id),
            NotificationEvent::StreakMilestone { .. }
            | NotificationEvent::HabitFormed { .. } => None,
        }
    }

    /// Template variables for message rendering.
    pub fn template_vars(&self) -> Vec<(&'static str, String)> {
        match self {
            NotificationEvent::TaskCreated {
                task_title,
                child_name,
                ..
            }
            | NotificationEvent::PhotoSubmitted {
                task_title,
                child_name,
                ..
            }
            | NotificationEvent::PhotoRejected {
                task_title,
                child_name,
                ..
            } => vec![
                ("taskTitle", task_title.clone()),
                ("childName", child_name.clone()),
            ],
            NotificationEvent::TaskCompleted {
                task_title,
                child_name,
                points,
                ..
            }
            | NotificationEvent::PhotoApproved {
                task_title,
                child_name,
                points,
                ..
            } => vec![
                ("taskTitle", task_title.clone()),
                ("childName", child_name.clone()),
                ("points", points.to_string()),
            ],
            NotificationEvent::TaskOverdue {
                task_title,
                child_name,
                hours,
                ..
            } => vec![
                ("taskTitle", task_title.clone()),
                ("childName", child_name.clone()),
                ("hours", format!("{}", hours.round() as i64)),
            ],
            NotificationEvent::TaskReminder {
                task_title,
                child_name,
                message,
                ..
            } => vec![
                ("taskTitle", task_title.clone()),
                ("childName", child_name.clone()),
                ("message", message.clone()),
            ],
            NotificationEvent::StreakMilestone {
                child_name, days, ..
            } => vec![
                ("childName", child_name.clone()),
                ("streak", days.to_string()),
            ],
            NotificationEvent::Escalation {
                task_title,
                child_name,
                level,
                hours,
                ..
            } => vec![
                ("taskTitle", task_title.clone()),
                ("childName", child_name.clone()),
                ("level", level.to_string()),
                ("hours", format!("{}", hours.round() as i64)),
            ],
            NotificationEvent::HabitFormed {
                child_name,
                task_title,
                days,
                ..
            } => vec![
                ("childName", child_name.clone()),
                ("taskTitle", task_title.clone()),
                ("days", days.to_string()),
            ],
        }
    }
}

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{([A-Za-z]+)\}").expect("valid regex");
}

/// Substitute `{placeholder}` markers in a message template.
///
/// Unknown placeholders are left verbatim so a misconfigured template is
/// visible rather than silently blank.
pub fn render_template(template: &str, vars: &[(&'static str, String)]) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Composite queue key: one entry per (event occurrence, recipient).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotificationKey {
    pub event_id: String,
    pub recipient_id: Uuid,
}

impl std::fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.event_id, self.recipient_id)
    }
}

/// A notification admitted to the dispatch queue, awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QueuedNotification {
    pub key: NotificationKey,
    pub rule: NotificationRule,
    pub event: NotificationEvent,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub sent: bool,
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedNotification {
    /// Rendered notification title.
    pub fn title(&self) -> String {
        render_template(&self.rule.title_template, &self.event.template_vars())
    }

    /// Rendered notification body.
    pub fn body(&self) -> String {
        render_template(&self.rule.body_template, &self.event.template_vars())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template_substitutes_vars() {
        let vars = vec![
            ("taskTitle", "Feed the dog".to_string()),
            ("childName", "Mia".to_string()),
        ];
        let out = render_template("{childName}, please do: {taskTitle}", &vars);
        assert_eq!(out, "Mia, please do: Feed the dog");
    }

    #[test]
    fn test_render_template_leaves_unknown_placeholder() {
        let out = render_template("Hello {nobody}", &[]);
        assert_eq!(out, "Hello {nobody}");
    }

    #[test]
    fn test_default_rules_cover_all_kinds() {
        let rules = default_rules();
        for kind in [
            EventKind::TaskCreated,
            EventKind::TaskCompleted,
            EventKind::TaskOverdue,
            EventKind::TaskReminder,
            EventKind::PhotoSubmitted,
            EventKind::PhotoApproved,
            EventKind::PhotoRejected,
            EventKind::StreakMilestone,
            EventKind::Escalation,
            EventKind::HabitFormed,
        ] {
            assert!(
                rules.iter().any(|r| r.kind == kind),
                "missing default rule for {}",
                kind
            );
        }
    }

    #[test]
    fn test_event_id_distinguishes_escalation_levels() {
        let task_id = Uuid::new_v4();
        let e1 = NotificationEvent::Escalation {
            task_id,
            task_title: "Homework".to_string(),
            child_name: "Leo".to_string(),
            level: 1,
            hours: 1.5,
        };
        let e2 = NotificationEvent::Escalation {
            task_id,
            task_title: "Homework".to_string(),
            child_name: "Leo".to_string(),
            level: 2,
            hours: 3.5,
        };
        assert_ne!(e1.event_id(), e2.event_id());
    }

    #[test]
    fn test_trigger_conditions_satisfied() {
        let cond = TriggerConditions {
            min_streak: Some(3),
            ..TriggerConditions::default()
        };
        assert!(cond.satisfied(&TriggerContext {
            streak: Some(5),
            ..TriggerContext::default()
        }));
        assert!(!cond.satisfied(&TriggerContext {
            streak: Some(2),
            ..TriggerContext::default()
        }));
        // Unknown context value fails the condition rather than passing it.
        assert!(!cond.satisfied(&TriggerContext::default()));
    }

    #[test]
    fn test_trigger_conditions_hours_overdue() {
        let cond = TriggerConditions {
            min_hours_overdue: Some(2.0),
            ..TriggerConditions::default()
        };
        assert!(cond.satisfied(&TriggerContext {
            hours_overdue: Some(2.5),
            ..TriggerContext::default()
        }));
        assert!(!cond.satisfied(&TriggerContext {
            hours_overdue: Some(1.0),
            ..TriggerContext::default()
        }));
    }

    #[test]
    fn test_queued_notification_renders_title_and_body() {
        let rule = default_rules()
            .into_iter()
            .find(|r| r.kind == EventKind::TaskOverdue)
            .unwrap();
        let event = NotificationEvent::TaskOverdue {
            task_id: Uuid::new_v4(),
            task_title: "Dishes".to_string(),
            child_name: "Ana".to_string(),
            hours: 3.2,
        };
        let key = NotificationKey {
            event_id: event.event_id(),
            recipient_id: Uuid::new_v4(),
        };
        let queued = QueuedNotification {
            key,
            rule,
            event,
            scheduled_for: Utc::now(),
            sent: false,
            attempts: 0,
            enqueued_at: Utc::now(),
        };
        assert_eq!(queued.title(), "Task overdue");
        assert_eq!(queued.body(), "\"Dishes\" is 3 hours overdue");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let event = NotificationEvent::StreakMilestone {
            child_id: Uuid::new_v4(),
            child_name: "Mia".to_string(),
            days: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "streak_milestone");
        let back: NotificationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_id(), event.event_id());
    }
}
