//! Adaptive reminder patterns and reminder strategy selection.
//!
//! A [`ReminderPattern`] is a per-child profile of response behavior,
//! updated after each observed completion that follows a reminder. The
//! strategy selector classifies a pending task into one of four cadences
//! based on priority, proof requirements, history, and overdue-ness.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::preferences::QuietHours;
use super::task::{Task, TaskPriority};

/// Exponential-moving-average weight applied to the prior completion rate.
const COMPLETION_RATE_DECAY: f64 = 0.9;
/// Exponential-moving-average weight applied to the prior response latency.
const RESPONSE_LATENCY_DECAY: f64 = 0.8;
/// Maximum learned optimal times kept per child.
const MAX_OPTIMAL_TIMES: usize = 5;
/// Candidates snap to a learned optimal time at most this far away.
const OPTIMAL_SNAP_MINUTES: i64 = 60;

/// A school-hours window during which reminders are pointless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SchoolHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Per-child adaptive reminder profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReminderPattern {
    pub child_id: Uuid,
    /// Times of day at which the child has historically responded, sorted.
    pub optimal_times: Vec<NaiveTime>,
    /// Rolling completion rate in [0, 1].
    pub completion_rate: f64,
    /// Rolling average minutes between reminder and completion.
    pub avg_response_minutes: f64,
    /// Preferred lead time before due, used by the gentle strategy.
    pub preferred_lead_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub school_hours: Option<SchoolHours>,
    pub quiet_hours: QuietHours,
    pub updated_at: DateTime<Utc>,
}

impl ReminderPattern {
    /// Starting profile for a child with no observed history.
    pub fn default_for(child_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            child_id,
            optimal_times: vec![
                NaiveTime::from_hms_opt(16, 0, 0).expect("valid time"),
                NaiveTime::from_hms_opt(18, 30, 0).expect("valid time"),
            ],
            completion_rate: 0.5,
            avg_response_minutes: 45.0,
            preferred_lead_minutes: 30,
            school_hours: Some(SchoolHours {
                start: NaiveTime::from_hms_opt(8, 0, 0).expect("valid time"),
                end: NaiveTime::from_hms_opt(15, 0, 0).expect("valid time"),
            }),
            quiet_hours: QuietHours::default(),
            updated_at: now,
        }
    }

    /// Fold an observed completion into the profile.
    ///
    /// `response_minutes` is the delay between the reminder firing and the
    /// completion. Non-responses are never recorded explicitly; the rate
    /// only moves at observed events.
    pub fn record_completion(
        &mut self,
        response_minutes: f64,
        completed_at: DateTime<Utc>,
    ) {
        self.completion_rate =
            COMPLETION_RATE_DECAY * self.completion_rate + (1.0 - COMPLETION_RATE_DECAY);
        self.avg_response_minutes = RESPONSE_LATENCY_DECAY * self.avg_response_minutes
            + (1.0 - RESPONSE_LATENCY_DECAY) * response_minutes;
        self.learn_optimal_time(completed_at.time());
        self.updated_at = completed_at;
    }

    /// Record a reminder that drew no response. The rate moves toward zero
    /// with the same decay used for completions.
    pub fn record_non_response(&mut self, observed_at: DateTime<Utc>) {
        self.completion_rate *= COMPLETION_RATE_DECAY;
        self.updated_at = observed_at;
    }

    fn learn_optimal_time(&mut self, t: NaiveTime) {
        // Times within half an hour of an existing entry are the same slot.
        let near_existing = self.optimal_times.iter().any(|existing| {
            let delta = (time_minutes(*existing) - time_minutes(t)).abs();
            delta <= 30
        });
        if near_existing {
            return;
        }
        self.optimal_times.push(t);
        self.optimal_times.sort();
        if self.optimal_times.len() > MAX_OPTIMAL_TIMES {
            self.optimal_times.remove(0);
        }
    }

    /// Snap a candidate send time to the nearest learned optimal time on
    /// the same day, if one lies within an hour of it.
    pub fn snap_to_optimal(&self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let candidate_minutes = time_minutes(candidate.time());
        let nearest = self
            .optimal_times
            .iter()
            .map(|t| (*t, (time_minutes(*t) - candidate_minutes).abs()))
            .min_by_key(|(_, delta)| *delta);
        match nearest {
            Some((t, delta)) if delta <= OPTIMAL_SNAP_MINUTES => {
                candidate.date_naive().and_time(t).and_utc()
            }
            _ => candidate,
        }
    }
}

fn time_minutes(t: NaiveTime) -> i64 {
    use chrono::Timelike;
    t.hour() as i64 * 60 + t.minute() as i64
}

/// Named reminder cadence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Escalated,
    Urgent,
    Moderate,
    Gentle,
}

/// A reminder cadence: how many reminders, how far before due, and with
/// what tone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReminderStrategy {
    pub kind: StrategyKind,
    pub reminders_per_day: u32,
    /// Minutes before due at which to remind, most distant first.
    pub lead_times_minutes: Vec<i64>,
    /// Message variants of increasing urgency; reminder `i` uses variant
    /// `min(i, len - 1)`.
    pub messages: Vec<String>,
}

impl ReminderStrategy {
    pub fn message_for(&self, sequence: usize) -> &str {
        let idx = sequence.min(self.messages.len().saturating_sub(1));
        &self.messages[idx]
    }
}

/// Minutes-until-due below which a task is treated as urgent.
const URGENT_DUE_WINDOW_MINUTES: i64 = 120;
/// Completion rate below which a child gets the moderate cadence.
const LOW_COMPLETION_RATE: f64 = 0.4;

/// Classify a pending task into a reminder strategy.
pub fn classify(task: &Task, pattern: &ReminderPattern, now: DateTime<Utc>) -> ReminderStrategy {
    if task.hours_overdue(now).is_some() {
        return ReminderStrategy {
            kind: StrategyKind::Escalated,
            reminders_per_day: 4,
            lead_times_minutes: vec![0],
            messages: vec![
                "\"{taskTitle}\" is overdue. Please do it right now!".to_string(),
                "Still waiting on \"{taskTitle}\". Do it now to avoid losing points."
                    .to_string(),
                "Last chance: \"{taskTitle}\" must be done before it escalates further."
                    .to_string(),
            ],
        };
    }

    let due_soon = task
        .due_at
        .map(|due| (due - now) <= Duration::minutes(URGENT_DUE_WINDOW_MINUTES))
        .unwrap_or(false);
    if task.priority == TaskPriority::High || due_soon {
        return ReminderStrategy {
            kind: StrategyKind::Urgent,
            reminders_per_day: 3,
            lead_times_minutes: vec![120, 60, 30],
            messages: vec![
                "Heads up: \"{taskTitle}\" is due in 2 hours.".to_string(),
                "\"{taskTitle}\" is due in 1 hour. Better start now!".to_string(),
                "Only 30 minutes left for \"{taskTitle}\"!".to_string(),
            ],
        };
    }

    if task.requires_photo || pattern.completion_rate < LOW_COMPLETION_RATE {
        return ReminderStrategy {
            kind: StrategyKind::Moderate,
            reminders_per_day: 2,
            lead_times_minutes: vec![180, 60],
            messages: vec![
                "Don't forget \"{taskTitle}\" today. Remember the photo!".to_string(),
                "\"{taskTitle}\" is due soon. Snap a photo when you're done.".to_string(),
            ],
        };
    }

    ReminderStrategy {
        kind: StrategyKind::Gentle,
        reminders_per_day: 1,
        lead_times_minutes: vec![pattern.preferred_lead_minutes],
        messages: vec!["Friendly reminder: \"{taskTitle}\" is coming up.".to_string()],
    }
}
