//! Per-user notification preferences and quiet-hours arithmetic.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::notification::{EventKind, Severity};

/// A daily time-of-day window during which non-critical notifications are
/// deferred. The window may wrap midnight (start > end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QuietHours {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            enabled: true,
            start,
            end,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            start: NaiveTime::from_hms_opt(21, 0, 0).expect("valid time"),
            end: NaiveTime::from_hms_opt(7, 0, 0).expect("valid time"),
        }
    }

    /// Whether a time of day falls inside the window.
    ///
    /// Half-open semantics: the start minute is inside, the end minute is
    /// outside. Windows with start > end wrap midnight.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }
        let minutes = |t: NaiveTime| {
            use chrono::Timelike;
            t.hour() as i64 * 60 + t.minute() as i64
        };
        let (t, start, end) = (minutes(t), minutes(self.start), minutes(self.end));
        if start <= end {
            t >= start && t < end
        } else {
            // Wraps midnight.
            t >= start || t < end
        }
    }

    /// Move a candidate delivery time out of the quiet window.
    ///
    /// Times outside the window (or with quiet hours disabled) pass through
    /// unchanged. Times inside move to the window's end on the same day,
    /// advancing one day when that end has already passed relative to the
    /// candidate (the wrapped-window case).
    pub fn adjust(&self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        if !self.contains(candidate.time()) {
            return candidate;
        }
        let mut adjusted = candidate
            .date_naive()
            .and_time(self.end)
            .and_utc();
        if adjusted <= candidate {
            adjusted += Duration::days(1);
        }
        adjusted
    }
}

impl Default for QuietHours {
    fn default() -> Self {
        Self::new(
            NaiveTime::from_hms_opt(21, 0, 0).expect("valid time"),
            NaiveTime::from_hms_opt(7, 0, 0).expect("valid time"),
        )
    }
}

/// Per-severity delivery override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityOverride {
    /// Deliver immediately, ignoring quiet hours.
    Always,
    /// Drop silently.
    Never,
    /// Deliver, deferring out of quiet hours as usual.
    QuietHoursOnly,
}

/// Per-user notification preferences.
///
/// Loaded at initialization and mutated only by explicit user action; when
/// no stored record exists the documented defaults apply.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub struct UserNotificationPreferences {
    pub user_id: Uuid,
    /// Enabled event kinds. `None` means all kinds are enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_kinds: Option<Vec<EventKind>>,
    pub quiet_hours: QuietHours,
    /// Window within which near-simultaneous notifications coalesce.
    #[validate(range(min = 0, max = 240))]
    pub grouping_window_minutes: i64,
    /// Maximum non-critical sends per rolling hour.
    #[validate(range(min = 1, max = 100))]
    pub max_per_hour: u32,
    #[serde(default)]
    pub severity_overrides: HashMap<Severity, SeverityOverride>,
}

impl UserNotificationPreferences {
    /// Documented defaults, used when no preferences record is stored.
    pub fn default_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            enabled_kinds: None,
            quiet_hours: QuietHours::default(),
            grouping_window_minutes: 15,
            max_per_hour: 10,
            severity_overrides: HashMap::new(),
        }
    }

    /// Whether the user has this event kind enabled.
    pub fn allows_kind(&self, kind: EventKind) -> bool {
        match &self.enabled_kinds {
            None => true,
            Some(kinds) => kinds.contains(&kind),
        }
    }

    /// Override configured for a severity, if any.
    pub fn override_for(&self, severity: Severity) -> Option<SeverityOverride> {
        self.severity_overrides.get(&severity).copied()
    }
}
