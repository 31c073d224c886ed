//! Recurrence rules and scheduled task templates.
//!
//! [`next_occurrence`] is a pure function of (now, rule) so materialization
//! is reproducible in tests with a manual clock.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{TaskCategory, TaskPriority};

/// Day of the week, stored as lowercase strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub fn matches(&self, weekday: Weekday) -> bool {
        matches!(
            (self, weekday),
            (DayOfWeek::Monday, Weekday::Mon)
                | (DayOfWeek::Tuesday, Weekday::Tue)
                | (DayOfWeek::Wednesday, Weekday::Wed)
                | (DayOfWeek::Thursday, Weekday::Thu)
                | (DayOfWeek::Friday, Weekday::Fri)
                | (DayOfWeek::Saturday, Weekday::Sat)
                | (DayOfWeek::Sunday, Weekday::Sun)
        )
    }
}

/// How often a template regenerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Custom,
}

/// A recurrence rule: kind, applicable weekdays, and time of day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecurrenceRule {
    pub kind: RecurrenceKind,
    /// Applicable weekdays; only consulted for weekly rules.
    #[serde(default)]
    pub days_of_week: Vec<DayOfWeek>,
    pub time_of_day: NaiveTime,
}

/// Next time a rule fires, strictly after `now`.
///
/// Daily rules fire at the configured time tomorrow. Weekly rules fire
/// today when today matches and the time has not yet passed, otherwise at
/// the next matching weekday within the coming week. Custom and unmatched
/// rules default to tomorrow at the configured time.
pub fn next_occurrence(now: DateTime<Utc>, rule: &RecurrenceRule) -> DateTime<Utc> {
    let at = |date: chrono::NaiveDate| date.and_time(rule.time_of_day).and_utc();
    let tomorrow = at(now.date_naive() + Duration::days(1));

    match rule.kind {
        RecurrenceKind::Daily => tomorrow,
        RecurrenceKind::Weekly => {
            if rule.days_of_week.is_empty() {
                return tomorrow;
            }
            let today_matches = rule
                .days_of_week
                .iter()
                .any(|d| d.matches(now.weekday()));
            if today_matches && now.time() < rule.time_of_day {
                return at(now.date_naive());
            }
            for offset in 1..=7 {
                let date = now.date_naive() + Duration::days(offset);
                if rule.days_of_week.iter().any(|d| d.matches(date.weekday())) {
                    return at(date);
                }
            }
            // Unreachable with a non-empty day list; scan is bounded at 7.
            tomorrow
        }
        RecurrenceKind::Custom => tomorrow,
    }
}

/// A template that periodically materializes concrete tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScheduledTaskTemplate {
    pub id: Uuid,
    pub family_id: Uuid,
    /// Child the materialized tasks are assigned to.
    pub child_id: Uuid,
    pub title: String,
    pub category: TaskCategory,
    pub priority: TaskPriority,
    pub points: i64,
    pub requires_photo: bool,
    pub rule: RecurrenceRule,
    /// Always strictly in the future relative to the last materialization.
    pub next_run_at: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTaskTemplate {
    /// Whether the template is due to materialize.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run_at <= now
    }
}
