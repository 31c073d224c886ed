//! Domain models for the Family Tasks notification engine.

pub mod escalation;
pub mod notification;
pub mod preferences;
pub mod recurrence;
pub mod reminder;
pub mod task;

pub use escalation::{
    default_levels, DeviceRestriction, EscalationAction, EscalationLevel, EscalationRecord,
    RestrictedCapability, RESTRICTION_TTL_HOURS,
};
pub use notification::{
    default_rules, render_template, EventKind, NotificationEvent, NotificationKey,
    NotificationRule, QueuedNotification, RecipientRole, Severity, TriggerConditions,
    TriggerContext,
};
pub use preferences::{QuietHours, SeverityOverride, UserNotificationPreferences};
pub use recurrence::{
    next_occurrence, DayOfWeek, RecurrenceKind, RecurrenceRule, ScheduledTaskTemplate,
};
pub use reminder::{classify, ReminderPattern, ReminderStrategy, SchoolHours, StrategyKind};
pub use task::{
    FamilyMember, FamilyRole, PointLedgerEntry, Task, TaskCategory, TaskPriority, TaskStatus,
};
