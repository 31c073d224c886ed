//! Notification dispatch queue.
//!
//! Central mailbox of pending notifications keyed by (event, recipient).
//! Admission applies preference filtering, the per-recipient rate limit,
//! quiet-hours deferral, and grouping before an entry is accepted; a
//! periodic drain pass performs delivery with a bounded retry budget.
//!
//! Admission and draining share one async mutex so a notification admitted
//! mid-drain is never lost or double-delivered.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use domain::models::{
    NotificationEvent, NotificationKey, NotificationRule, QueuedNotification, Severity,
    SeverityOverride, UserNotificationPreferences,
};
use domain::services::{Clock, PushSender};

use crate::config::QueueConfig;
use crate::error::EngineError;
use crate::repo::{collections, Repo};

/// Minutes in the rolling rate-limit window.
const RATE_WINDOW_MINUTES: i64 = 60;

struct QueueState {
    entries: HashMap<NotificationKey, QueuedNotification>,
    /// Recent successful send times per recipient, newest at the back.
    recent_sends: HashMap<Uuid, VecDeque<DateTime<Utc>>>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub delivered: usize,
    pub failed: usize,
    pub evicted: usize,
    pub skipped_no_token: usize,
}

/// The notification dispatch queue.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    repo: Repo,
    push: Arc<dyn PushSender>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl DispatchQueue {
    pub fn new(
        repo: Repo,
        push: Arc<dyn PushSender>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: HashMap::new(),
                recent_sends: HashMap::new(),
            }),
            repo,
            push,
            clock,
            config,
        }
    }

    /// Admit a notification for each recipient.
    ///
    /// Recipients whose preferences filter the event out are dropped
    /// silently; a store failure while loading preferences abandons that
    /// recipient for this cycle. Returns the keys actually admitted.
    pub async fn enqueue(
        &self,
        rule: &NotificationRule,
        event: &NotificationEvent,
        recipients: &[Uuid],
        scheduled_for: DateTime<Utc>,
    ) -> Vec<NotificationKey> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut admitted = Vec::new();

        for &recipient in recipients {
            let prefs = match self.load_preferences(recipient).await {
                Ok(prefs) => prefs,
                Err(e) => {
                    warn!(
                        recipient = %recipient,
                        error = %e,
                        "Failed to load preferences; skipping recipient this cycle"
                    );
                    continue;
                }
            };

            if !prefs.allows_kind(rule.kind) {
                debug!(
                    recipient = %recipient,
                    kind = %rule.kind,
                    "Event kind disabled by preferences"
                );
                continue;
            }

            let severity_override = prefs.override_for(rule.severity);
            if severity_override == Some(SeverityOverride::Never) {
                debug!(
                    recipient = %recipient,
                    severity = ?rule.severity,
                    "Severity muted by preferences"
                );
                continue;
            }

            if rule.severity != Severity::Critical
                && Self::sends_in_window(&state, recipient, now) >= prefs.max_per_hour as usize
            {
                counter!("notifications_rate_limited_total").increment(1);
                warn!(
                    recipient = %recipient,
                    max_per_hour = prefs.max_per_hour,
                    "Rate limit reached; dropping notification"
                );
                continue;
            }

            // Critical delivers immediately; Always skips only the
            // quiet-hours deferral.
            let mut when = scheduled_for;
            if rule.severity != Severity::Critical
                && severity_override != Some(SeverityOverride::Always)
            {
                when = prefs.quiet_hours.adjust(when);
            }

            if rule.severity != Severity::Critical {
                when = Self::group_with_existing(
                    &state,
                    recipient,
                    when,
                    prefs.grouping_window_minutes,
                );
            }

            let key = NotificationKey {
                event_id: event.event_id(),
                recipient_id: recipient,
            };
            // Idempotent upsert: the same occurrence re-admitted for the
            // same recipient replaces the prior entry.
            state.entries.insert(
                key.clone(),
                QueuedNotification {
                    key: key.clone(),
                    rule: rule.clone(),
                    event: event.clone(),
                    scheduled_for: when,
                    sent: false,
                    attempts: 0,
                    enqueued_at: now,
                },
            );
            counter!("notifications_enqueued_total").increment(1);
            admitted.push(key);
        }

        admitted
    }

    /// Deliver every due entry, applying the retry budget.
    pub async fn drain(&self) -> DrainStats {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut stats = DrainStats::default();

        let due_keys: Vec<NotificationKey> = state
            .entries
            .values()
            .filter(|n| !n.sent && n.scheduled_for <= now)
            .map(|n| n.key.clone())
            .collect();

        for key in due_keys {
            let Some(notification) = state.entries.get(&key).cloned() else {
                continue;
            };

            let member = match self.repo.member(key.recipient_id).await {
                Ok(member) => member,
                Err(e) => {
                    // Store hiccup: leave the entry for the next pass.
                    warn!(key = %key, error = %e, "Recipient lookup failed; will retry");
                    continue;
                }
            };
            let token = member.and_then(|m| m.device_token);
            let Some(token) = token else {
                // Not an error: recipients without a registered device
                // simply miss the push.
                warn!(key = %key, "No device token for recipient; dropping");
                state.entries.remove(&key);
                stats.skipped_no_token += 1;
                continue;
            };

            let title = notification.title();
            let body = notification.body();
            let data = serde_json::json!({
                "kind": notification.rule.kind.to_string(),
                "event_id": key.event_id,
            });

            if self.push.send(&token, &title, &body, &data).await.is_sent() {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.sent = true;
                }
                Self::record_send(&mut state, key.recipient_id, now, self.config.send_window_hours);
                counter!("notifications_sent_total").increment(1);
                stats.delivered += 1;
                info!(key = %key, "Notification delivered");
            } else {
                stats.failed += 1;
                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                entry.attempts += 1;
                let attempts = entry.attempts;
                if attempts >= self.config.max_attempts {
                    state.entries.remove(&key);
                    counter!("notifications_evicted_total").increment(1);
                    stats.evicted += 1;
                    warn!(
                        key = %key,
                        attempts = attempts,
                        "Delivery failed repeatedly; evicting notification"
                    );
                } else {
                    warn!(key = %key, attempts = attempts, "Delivery failed; will retry");
                }
            }
        }

        state.entries.retain(|_, n| !n.sent);
        stats
    }

    /// Number of unsent entries, for tests and the summary log line.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Scheduled time of a queued entry, if present.
    pub async fn scheduled_for(&self, key: &NotificationKey) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .entries
            .get(key)
            .map(|n| n.scheduled_for)
    }

    async fn load_preferences(
        &self,
        user_id: Uuid,
    ) -> Result<UserNotificationPreferences, EngineError> {
        let stored: Option<UserNotificationPreferences> = self
            .repo
            .get(collections::PREFERENCES, &user_id.to_string())
            .await?;
        Ok(stored.unwrap_or_else(|| UserNotificationPreferences::default_for(user_id)))
    }

    fn sends_in_window(state: &QueueState, recipient: Uuid, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(RATE_WINDOW_MINUTES);
        state
            .recent_sends
            .get(&recipient)
            .map(|sends| sends.iter().filter(|&&t| t > cutoff).count())
            .unwrap_or(0)
    }

    fn record_send(
        state: &mut QueueState,
        recipient: Uuid,
        now: DateTime<Utc>,
        window_hours: i64,
    ) {
        let sends = state.recent_sends.entry(recipient).or_default();
        sends.push_back(now);
        let cutoff = now - Duration::hours(window_hours);
        while sends.front().is_some_and(|&t| t < cutoff) {
            sends.pop_front();
        }
    }

    /// Coalesce with an already-queued unsent notification for the same
    /// recipient when their slots are within the grouping window.
    fn group_with_existing(
        state: &QueueState,
        recipient: Uuid,
        candidate: DateTime<Utc>,
        window_minutes: i64,
    ) -> DateTime<Utc> {
        let window = Duration::minutes(window_minutes);
        state
            .entries
            .values()
            .filter(|n| !n.sent && n.key.recipient_id == recipient)
            .map(|n| n.scheduled_for)
            .find(|&existing| (existing - candidate).abs() <= window)
            .unwrap_or(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use domain::models::{
        default_rules, EventKind, FamilyMember, FamilyRole, QuietHours,
    };
    use domain::services::{ManualClock, MockPushSender};
    use store::MemoryStore;

    struct Fixture {
        queue: DispatchQueue,
        repo: Repo,
        push: Arc<MockPushSender>,
        clock: Arc<ManualClock>,
        recipient: Uuid,
    }

    async fn fixture() -> Fixture {
        fixture_at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()).await
    }

    async fn fixture_at(start: DateTime<Utc>) -> Fixture {
        let repo = Repo::new(Arc::new(MemoryStore::new()));
        let push = Arc::new(MockPushSender::new());
        let clock = Arc::new(ManualClock::new(start));
        let recipient = Uuid::new_v4();

        let member = FamilyMember {
            id: recipient,
            family_id: Uuid::new_v4(),
            display_name: "Mia".to_string(),
            role: FamilyRole::Child,
            points: 0,
            current_streak: 0,
            device_token: Some("tok-1".to_string()),
        };
        repo.put(collections::MEMBERS, &recipient.to_string(), &member)
            .await
            .unwrap();

        // Disable quiet hours so timing tests control deferral explicitly.
        let mut prefs = UserNotificationPreferences::default_for(recipient);
        prefs.quiet_hours = QuietHours::disabled();
        prefs.max_per_hour = 3;
        repo.put(collections::PREFERENCES, &recipient.to_string(), &prefs)
            .await
            .unwrap();

        let queue = DispatchQueue::new(
            repo.clone(),
            push.clone(),
            clock.clone(),
            QueueConfig::default(),
        );
        Fixture {
            queue,
            repo,
            push,
            clock,
            recipient,
        }
    }

    fn rule(kind: EventKind) -> NotificationRule {
        default_rules()
            .into_iter()
            .find(|r| r.kind == kind)
            .unwrap()
    }

    fn overdue_event(task_id: Uuid) -> NotificationEvent {
        NotificationEvent::TaskOverdue {
            task_id,
            task_title: "Dishes".to_string(),
            child_name: "Mia".to_string(),
            hours: 2.0,
        }
    }

    fn critical_rule() -> NotificationRule {
        let mut r = rule(EventKind::Escalation);
        r.severity = Severity::Critical;
        r
    }

    #[tokio::test]
    async fn test_enqueue_and_drain_delivers() {
        let f = fixture().await;
        let now = f.clock.now();
        let admitted = f
            .queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                now,
            )
            .await;
        assert_eq!(admitted.len(), 1);

        let stats = f.queue.drain().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(f.push.sent_count(), 1);
        assert_eq!(f.queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_future_entry_not_drained_early() {
        let f = fixture().await;
        let now = f.clock.now();
        f.queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                now + Duration::minutes(20),
            )
            .await;

        assert_eq!(f.queue.drain().await.delivered, 0);
        f.clock.advance(Duration::minutes(21));
        assert_eq!(f.queue.drain().await.delivered, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_fourth_but_admits_critical() {
        let f = fixture().await;
        let now = f.clock.now();

        // Deliver three notifications inside the rolling hour.
        for _ in 0..3 {
            let task = Uuid::new_v4();
            f.queue
                .enqueue(&rule(EventKind::TaskOverdue), &overdue_event(task), &[f.recipient], now)
                .await;
            f.queue.drain().await;
        }
        assert_eq!(f.push.sent_count(), 3);

        // Fourth medium-severity notification is rejected.
        let admitted = f
            .queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                now,
            )
            .await;
        assert!(admitted.is_empty());

        // Critical bypasses the limit.
        let event = NotificationEvent::Escalation {
            task_id: Uuid::new_v4(),
            task_title: "Dishes".to_string(),
            child_name: "Mia".to_string(),
            level: 4,
            hours: 25.0,
        };
        let admitted = f
            .queue
            .enqueue(&critical_rule(), &event, &[f.recipient], now)
            .await;
        assert_eq!(admitted.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_window_slides() {
        let f = fixture().await;
        let now = f.clock.now();
        for _ in 0..3 {
            f.queue
                .enqueue(
                    &rule(EventKind::TaskOverdue),
                    &overdue_event(Uuid::new_v4()),
                    &[f.recipient],
                    now,
                )
                .await;
            f.queue.drain().await;
        }

        // An hour later the window has slid past the prior sends.
        f.clock.advance(Duration::minutes(61));
        let admitted = f
            .queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                f.clock.now(),
            )
            .await;
        assert_eq!(admitted.len(), 1);
    }

    #[tokio::test]
    async fn test_grouping_coalesces_nearby_slots() {
        let f = fixture().await;
        let now = f.clock.now();
        let first = f
            .queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                now + Duration::minutes(10),
            )
            .await;
        let second = f
            .queue
            .enqueue(
                &rule(EventKind::TaskCreated),
                &NotificationEvent::TaskCreated {
                    task_id: Uuid::new_v4(),
                    task_title: "Laundry".to_string(),
                    child_name: "Mia".to_string(),
                },
                &[f.recipient],
                now + Duration::minutes(15),
            )
            .await;

        let t1 = f.queue.scheduled_for(&first[0]).await.unwrap();
        let t2 = f.queue.scheduled_for(&second[0]).await.unwrap();
        assert_eq!(t1, t2);
    }

    #[tokio::test]
    async fn test_critical_bypasses_grouping() {
        let f = fixture().await;
        let now = f.clock.now();
        f.queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                now + Duration::minutes(10),
            )
            .await;
        let critical = f
            .queue
            .enqueue(
                &critical_rule(),
                &NotificationEvent::Escalation {
                    task_id: Uuid::new_v4(),
                    task_title: "Dishes".to_string(),
                    child_name: "Mia".to_string(),
                    level: 4,
                    hours: 25.0,
                },
                &[f.recipient],
                now,
            )
            .await;
        assert_eq!(f.queue.scheduled_for(&critical[0]).await.unwrap(), now);
    }

    #[tokio::test]
    async fn test_quiet_hours_defer_and_critical_bypass() {
        // 22:30, inside default quiet hours 21:00-07:00.
        let f = fixture_at(Utc.with_ymd_and_hms(2024, 3, 1, 22, 30, 0).unwrap()).await;
        let mut prefs = UserNotificationPreferences::default_for(f.recipient);
        prefs.max_per_hour = 10;
        f.repo
            .put(collections::PREFERENCES, &f.recipient.to_string(), &prefs)
            .await
            .unwrap();

        let now = f.clock.now();
        let admitted = f
            .queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                now,
            )
            .await;
        assert_eq!(
            f.queue.scheduled_for(&admitted[0]).await.unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 2, 7, 0, 0).unwrap()
        );

        let critical = f
            .queue
            .enqueue(
                &critical_rule(),
                &NotificationEvent::Escalation {
                    task_id: Uuid::new_v4(),
                    task_title: "Dishes".to_string(),
                    child_name: "Mia".to_string(),
                    level: 4,
                    hours: 25.0,
                },
                &[f.recipient],
                now,
            )
            .await;
        assert_eq!(f.queue.scheduled_for(&critical[0]).await.unwrap(), now);
    }

    #[tokio::test]
    async fn test_retry_cap_evicts_after_three_attempts() {
        let f = fixture().await;
        f.push.set_failing(true);
        let now = f.clock.now();
        f.queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                now,
            )
            .await;

        assert_eq!(f.queue.drain().await.failed, 1);
        assert_eq!(f.queue.drain().await.failed, 1);
        let third = f.queue.drain().await;
        assert_eq!(third.failed, 1);
        assert_eq!(third.evicted, 1);

        // Never attempted a fourth time.
        let fourth = f.queue.drain().await;
        assert_eq!(fourth.failed, 0);
        assert_eq!(f.queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_token_skips_without_attempt() {
        let f = fixture().await;
        let tokenless = Uuid::new_v4();
        let member = FamilyMember {
            id: tokenless,
            family_id: Uuid::new_v4(),
            display_name: "Pa".to_string(),
            role: FamilyRole::Parent,
            points: 0,
            current_streak: 0,
            device_token: None,
        };
        f.repo
            .put(collections::MEMBERS, &tokenless.to_string(), &member)
            .await
            .unwrap();

        let now = f.clock.now();
        f.queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[tokenless],
                now,
            )
            .await;
        let stats = f.queue.drain().await;
        assert_eq!(stats.skipped_no_token, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(f.queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_reenqueue_same_key_overwrites() {
        let f = fixture().await;
        let now = f.clock.now();
        let task = Uuid::new_v4();
        f.queue
            .enqueue(&rule(EventKind::TaskOverdue), &overdue_event(task), &[f.recipient], now)
            .await;
        f.queue
            .enqueue(&rule(EventKind::TaskOverdue), &overdue_event(task), &[f.recipient], now)
            .await;
        assert_eq!(f.queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_disabled_kind_dropped() {
        let f = fixture().await;
        let mut prefs = UserNotificationPreferences::default_for(f.recipient);
        prefs.enabled_kinds = Some(vec![EventKind::Escalation]);
        f.repo
            .put(collections::PREFERENCES, &f.recipient.to_string(), &prefs)
            .await
            .unwrap();

        let admitted = f
            .queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                f.clock.now(),
            )
            .await;
        assert!(admitted.is_empty());
    }

    #[tokio::test]
    async fn test_never_override_drops() {
        let f = fixture().await;
        let mut prefs = UserNotificationPreferences::default_for(f.recipient);
        prefs.quiet_hours = QuietHours::disabled();
        prefs
            .severity_overrides
            .insert(Severity::Medium, SeverityOverride::Never);
        f.repo
            .put(collections::PREFERENCES, &f.recipient.to_string(), &prefs)
            .await
            .unwrap();

        let admitted = f
            .queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[f.recipient],
                f.clock.now(),
            )
            .await;
        assert!(admitted.is_empty());
    }

    #[tokio::test]
    async fn test_missing_preferences_fall_back_to_defaults() {
        let f = fixture().await;
        // A recipient with no stored preferences record.
        let fresh = Uuid::new_v4();
        let member = FamilyMember {
            id: fresh,
            family_id: Uuid::new_v4(),
            display_name: "New".to_string(),
            role: FamilyRole::Parent,
            points: 0,
            current_streak: 0,
            device_token: Some("tok-2".to_string()),
        };
        f.repo
            .put(collections::MEMBERS, &fresh.to_string(), &member)
            .await
            .unwrap();

        // Noon is outside the default quiet window, so this admits as-is.
        let admitted = f
            .queue
            .enqueue(
                &rule(EventKind::TaskOverdue),
                &overdue_event(Uuid::new_v4()),
                &[fresh],
                f.clock.now(),
            )
            .await;
        assert_eq!(admitted.len(), 1);
    }
}
