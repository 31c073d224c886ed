//! Smart reminder scheduling.
//!
//! For each pending task the scheduler classifies a cadence (escalated,
//! urgent, moderate, gentle), places candidate send times relative to the
//! due date, bends them around school hours, quiet hours, and the child's
//! learned optimal times, and registers them on the shared timer wheel.
//! A follow-up check fires after each reminder to fold the observed
//! response (or lack of one) back into the child's pattern.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use domain::models::{
    classify, render_template, NotificationEvent, NotificationRule, ReminderPattern, SchoolHours,
    StrategyKind,
};
use domain::services::Clock;

use crate::error::EngineError;
use crate::queue::DispatchQueue;
use crate::repo::{collections, Repo};
use crate::timers::{TimerKey, TimerWheel};

/// Payload carried by a reminder timer.
#[derive(Debug, Clone)]
pub enum ReminderTimer {
    /// Send reminder `sequence` for the task.
    Fire {
        sequence: u32,
        message: String,
        strategy: StrategyKind,
    },
    /// Check whether reminder `sequence` drew a response.
    FollowUp {
        sequence: u32,
        fired_at: DateTime<Utc>,
    },
}

/// The reminder schedule chosen for one task.
#[derive(Debug, Clone)]
pub struct ReminderPlan {
    pub task_id: Uuid,
    pub strategy: StrategyKind,
    /// (sequence, fire time) pairs actually registered.
    pub scheduled: Vec<(u32, DateTime<Utc>)>,
}

/// The reminder strategy selector and timer driver.
pub struct ReminderScheduler {
    repo: Repo,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    wheel: TimerWheel<ReminderTimer>,
    /// Rule for reminder notifications.
    rule: NotificationRule,
    follow_up_minutes: i64,
}

impl ReminderScheduler {
    pub fn new(
        repo: Repo,
        queue: Arc<DispatchQueue>,
        clock: Arc<dyn Clock>,
        rule: NotificationRule,
        follow_up_minutes: i64,
    ) -> Self {
        Self {
            repo,
            queue,
            clock,
            wheel: TimerWheel::new(),
            rule,
            follow_up_minutes,
        }
    }

    /// Plan and register reminders for a task.
    ///
    /// Rescheduling replaces the task's previous reminders wholesale, so a
    /// due-date change never leaves stale timers behind.
    pub async fn schedule_for_task(&self, task_id: Uuid) -> Result<ReminderPlan, EngineError> {
        let task = self
            .repo
            .task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))?;
        if !task.is_pending() {
            return Err(EngineError::InvalidInput(format!(
                "task {} is not pending",
                task_id
            )));
        }
        let Some(due_at) = task.due_at else {
            return Err(EngineError::InvalidInput(format!(
                "task {} has no due date",
                task_id
            )));
        };
        let child = self.repo.require_child(task.assigned_to).await?;

        let now = self.clock.now();
        let pattern = self.load_or_seed_pattern(child.id, now).await?;
        let strategy = classify(&task, &pattern, now);

        self.wheel.cancel_task(task_id);
        let mut scheduled = Vec::new();
        for (sequence, lead) in strategy.lead_times_minutes.iter().enumerate() {
            let sequence = sequence as u32;
            let fire_at = if strategy.kind == StrategyKind::Escalated {
                // Overdue: remind immediately, not relative to the due date.
                now
            } else {
                let candidate = due_at - Duration::minutes(*lead);
                let adjusted = adjust_candidate(candidate, &pattern);
                if adjusted < now {
                    debug!(
                        task_id = %task_id,
                        sequence = sequence,
                        "Reminder slot already in the past; skipping"
                    );
                    continue;
                }
                adjusted
            };

            let message = render_template(
                strategy.message_for(sequence as usize),
                &[
                    ("taskTitle", task.title.clone()),
                    ("childName", child.display_name.clone()),
                ],
            );
            self.wheel.schedule(
                TimerKey::new(task_id, format!("reminder:{}", sequence)),
                fire_at,
                ReminderTimer::Fire {
                    sequence,
                    message,
                    strategy: strategy.kind,
                },
            );
            scheduled.push((sequence, fire_at));
        }

        info!(
            task_id = %task_id,
            strategy = ?strategy.kind,
            reminders = scheduled.len(),
            "Reminders scheduled"
        );
        Ok(ReminderPlan {
            task_id,
            strategy: strategy.kind,
            scheduled,
        })
    }

    /// Drop every pending reminder and follow-up for a task.
    pub fn cancel_for_task(&self, task_id: Uuid) {
        self.wheel.cancel_task(task_id);
    }

    /// Stop future reminders for a task that is no longer pending, keeping
    /// its follow-up checks so observed responses still feed the pattern.
    pub fn stop_reminders(&self, task_id: Uuid) {
        self.wheel.cancel_task_prefix(task_id, "reminder:");
    }

    /// Fire every due timer. Returns the number processed.
    pub async fn poll(&self) -> usize {
        let now = self.clock.now();
        let due = self.wheel.drain_due(now);
        let count = due.len();
        for (key, timer) in due {
            let result = match timer {
                ReminderTimer::Fire {
                    sequence, message, ..
                } => self.fire(key.task_id, sequence, message, now).await,
                ReminderTimer::FollowUp { sequence, fired_at } => {
                    self.follow_up(key.task_id, sequence, fired_at, now).await
                }
            };
            if let Err(e) = result {
                warn!(key = %key, error = %e, "Reminder timer failed");
            }
        }
        count
    }

    /// Number of live timers, for tests and the status log line.
    pub fn pending_timers(&self) -> usize {
        self.wheel.len()
    }

    /// Drop all timers. Used on dispose.
    pub fn clear(&self) {
        self.wheel.clear();
    }

    async fn fire(
        &self,
        task_id: Uuid,
        sequence: u32,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(task) = self.repo.task(task_id).await? else {
            self.wheel.cancel_task(task_id);
            return Ok(());
        };
        if !task.is_pending() {
            // Completed or expired since scheduling; drop the remaining
            // reminders but keep pending follow-ups.
            self.stop_reminders(task_id);
            return Ok(());
        }
        let child = self
            .repo
            .member(task.assigned_to)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("member {}", task.assigned_to)))?;

        let event = NotificationEvent::TaskReminder {
            task_id,
            task_title: task.title.clone(),
            child_name: child.display_name.clone(),
            sequence,
            message,
        };
        self.queue
            .enqueue(&self.rule, &event, &[child.id], now)
            .await;
        counter!("reminders_fired_total").increment(1);

        self.wheel.schedule(
            TimerKey::new(task_id, format!("followup:{}", sequence)),
            now + Duration::minutes(self.follow_up_minutes),
            ReminderTimer::FollowUp {
                sequence,
                fired_at: now,
            },
        );
        Ok(())
    }

    /// Fold the response to one reminder into the child's pattern.
    async fn follow_up(
        &self,
        task_id: Uuid,
        sequence: u32,
        fired_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(task) = self.repo.task(task_id).await? else {
            return Ok(());
        };
        let mut pattern = self.load_or_seed_pattern(task.assigned_to, now).await?;

        if let Some(completed_at) = task.completed_at.filter(|_| !task.is_pending()) {
            let response_minutes =
                ((completed_at - fired_at).num_seconds() as f64 / 60.0).max(0.0);
            pattern.record_completion(response_minutes, completed_at);
            debug!(
                task_id = %task_id,
                sequence = sequence,
                response_minutes = response_minutes,
                "Reminder answered"
            );
        } else {
            pattern.record_non_response(now);
            debug!(task_id = %task_id, sequence = sequence, "Reminder unanswered");
        }
        self.repo
            .put(
                collections::PATTERNS,
                &pattern.child_id.to_string(),
                &pattern,
            )
            .await?;
        Ok(())
    }

    async fn load_or_seed_pattern(
        &self,
        child_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReminderPattern, EngineError> {
        if let Some(pattern) = self
            .repo
            .get(collections::PATTERNS, &child_id.to_string())
            .await?
        {
            return Ok(pattern);
        }
        let pattern = ReminderPattern::default_for(child_id, now);
        self.repo
            .put(collections::PATTERNS, &child_id.to_string(), &pattern)
            .await?;
        Ok(pattern)
    }
}

/// Bend a candidate send time around the child's schedule: snap to a
/// learned optimal time, then move out of school hours, then out of quiet
/// hours.
fn adjust_candidate(candidate: DateTime<Utc>, pattern: &ReminderPattern) -> DateTime<Utc> {
    let mut adjusted = pattern.snap_to_optimal(candidate);
    if let Some(school) = &pattern.school_hours {
        adjusted = shift_out_of_school(adjusted, school);
    }
    pattern.quiet_hours.adjust(adjusted)
}

fn shift_out_of_school(candidate: DateTime<Utc>, school: &SchoolHours) -> DateTime<Utc> {
    let t = candidate.time();
    if t >= school.start && t < school.end {
        candidate.date_naive().and_time(school.end).and_utc()
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};
    use domain::models::{
        default_rules, EventKind, FamilyMember, FamilyRole, QuietHours, Task, TaskCategory,
        TaskPriority, TaskStatus,
    };
    use domain::services::{ManualClock, MockPushSender};
    use serde_json::json;
    use store::MemoryStore;

    struct Fixture {
        scheduler: ReminderScheduler,
        queue: Arc<DispatchQueue>,
        repo: Repo,
        push: Arc<MockPushSender>,
        clock: Arc<ManualClock>,
        child_id: Uuid,
        family_id: Uuid,
    }

    async fn fixture() -> Fixture {
        // A Friday mid-morning.
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let repo = Repo::new(Arc::new(MemoryStore::new()));
        let clock = Arc::new(ManualClock::new(start));
        let push = Arc::new(MockPushSender::new());
        let queue = Arc::new(DispatchQueue::new(
            repo.clone(),
            push.clone(),
            clock.clone(),
            crate::config::QueueConfig::default(),
        ));
        let rule = default_rules()
            .into_iter()
            .find(|r| r.kind == EventKind::TaskReminder)
            .unwrap();
        let scheduler =
            ReminderScheduler::new(repo.clone(), queue.clone(), clock.clone(), rule, 30);

        let family_id = Uuid::new_v4();
        let child_id = Uuid::new_v4();
        let child = FamilyMember {
            id: child_id,
            family_id,
            display_name: "Mia".to_string(),
            role: FamilyRole::Child,
            points: 0,
            current_streak: 0,
            device_token: Some("tok-1".to_string()),
        };
        repo.put(collections::MEMBERS, &child_id.to_string(), &child)
            .await
            .unwrap();

        Fixture {
            scheduler,
            queue,
            repo,
            push,
            clock,
            child_id,
            family_id,
        }
    }

    impl Fixture {
        async fn insert_task(&self, priority: TaskPriority, due_at: DateTime<Utc>) -> Task {
            let task = Task {
                id: Uuid::new_v4(),
                family_id: self.family_id,
                title: "Clean room".to_string(),
                category: TaskCategory::Chore,
                assigned_to: self.child_id,
                points: 10,
                requires_photo: false,
                priority,
                status: TaskStatus::Pending,
                due_at: Some(due_at),
                escalation_level: 0,
                created_at: self.clock.now(),
                completed_at: None,
            };
            self.repo
                .put(collections::TASKS, &task.id.to_string(), &task)
                .await
                .unwrap();
            task
        }

        /// Neutral pattern: no school hours, no quiet hours, no optimal
        /// times, so fire times land exactly on the lead offsets.
        async fn neutral_pattern(&self) {
            let mut pattern = ReminderPattern::default_for(self.child_id, self.clock.now());
            pattern.optimal_times.clear();
            pattern.school_hours = None;
            pattern.quiet_hours = QuietHours::disabled();
            self.repo
                .put(collections::PATTERNS, &self.child_id.to_string(), &pattern)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_urgent_task_gets_three_reminders() {
        let f = fixture().await;
        f.neutral_pattern().await;
        let due = f.clock.now() + Duration::hours(5);
        let task = f.insert_task(TaskPriority::High, due).await;

        let plan = f.scheduler.schedule_for_task(task.id).await.unwrap();
        assert_eq!(plan.strategy, StrategyKind::Urgent);
        let times: Vec<DateTime<Utc>> = plan.scheduled.iter().map(|(_, t)| *t).collect();
        assert_eq!(
            times,
            vec![
                due - Duration::minutes(120),
                due - Duration::minutes(60),
                due - Duration::minutes(30),
            ]
        );
    }

    #[tokio::test]
    async fn test_overdue_task_fires_immediately() {
        let f = fixture().await;
        f.neutral_pattern().await;
        let task = f
            .insert_task(TaskPriority::Low, f.clock.now() - Duration::hours(2))
            .await;
        let plan = f.scheduler.schedule_for_task(task.id).await.unwrap();
        assert_eq!(plan.strategy, StrategyKind::Escalated);
        assert_eq!(plan.scheduled, vec![(0, f.clock.now())]);

        let fired = f.scheduler.poll().await;
        assert_eq!(fired, 1);
        // Reminder went through the queue to the child.
        let stats = f.queue.drain().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(f.push.sent_count(), 1);
        let sent = f.push.sent();
        assert!(sent[0].body.contains("Clean room"));
    }

    #[tokio::test]
    async fn test_candidate_snaps_to_optimal_time() {
        let f = fixture().await;
        let mut pattern = ReminderPattern::default_for(f.child_id, f.clock.now());
        pattern.school_hours = None;
        pattern.quiet_hours = QuietHours::disabled();
        pattern.optimal_times = vec![NaiveTime::from_hms_opt(16, 0, 0).unwrap()];
        f.repo
            .put(collections::PATTERNS, &f.child_id.to_string(), &pattern)
            .await
            .unwrap();

        // Gentle lead of 30 minutes before a 17:10 due time is 16:40,
        // within an hour of the learned 16:00 slot.
        let due = Utc.with_ymd_and_hms(2024, 3, 1, 17, 10, 0).unwrap();
        let task = f.insert_task(TaskPriority::Low, due).await;
        let plan = f.scheduler.schedule_for_task(task.id).await.unwrap();
        assert_eq!(plan.strategy, StrategyKind::Gentle);
        assert_eq!(
            plan.scheduled[0].1,
            Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_candidate_avoids_school_hours() {
        let f = fixture().await;
        let mut pattern = ReminderPattern::default_for(f.child_id, f.clock.now());
        pattern.optimal_times.clear();
        pattern.quiet_hours = QuietHours::disabled();
        f.repo
            .put(collections::PATTERNS, &f.child_id.to_string(), &pattern)
            .await
            .unwrap();

        // Gentle candidate at 12:30 falls inside 08:00-15:00 school hours.
        let due = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
        let task = f.insert_task(TaskPriority::Low, due).await;
        let plan = f.scheduler.schedule_for_task(task.id).await.unwrap();
        assert_eq!(
            plan.scheduled[0].1,
            Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_reschedule_replaces_previous_plan() {
        let f = fixture().await;
        f.neutral_pattern().await;
        let due = f.clock.now() + Duration::hours(5);
        let task = f.insert_task(TaskPriority::High, due).await;
        f.scheduler.schedule_for_task(task.id).await.unwrap();
        assert_eq!(f.scheduler.pending_timers(), 3);

        // Due date moves out; priority drops to gentle cadence.
        f.repo
            .patch(
                collections::TASKS,
                &task.id.to_string(),
                json!({
                    "priority": "low",
                    "due_at": (f.clock.now() + Duration::hours(10)).to_rfc3339(),
                }),
            )
            .await
            .unwrap();
        let plan = f.scheduler.schedule_for_task(task.id).await.unwrap();
        assert_eq!(plan.strategy, StrategyKind::Gentle);
        assert_eq!(f.scheduler.pending_timers(), 1);
    }

    #[tokio::test]
    async fn test_completed_task_stops_remaining_reminders() {
        let f = fixture().await;
        f.neutral_pattern().await;
        let due = f.clock.now() + Duration::hours(5);
        let task = f.insert_task(TaskPriority::High, due).await;
        f.scheduler.schedule_for_task(task.id).await.unwrap();

        f.repo
            .patch(
                collections::TASKS,
                &task.id.to_string(),
                json!({ "status": "completed", "completed_at": f.clock.now().to_rfc3339() }),
            )
            .await
            .unwrap();

        // First reminder comes due, sees the completed task, and cancels
        // the remaining two.
        f.clock.advance(Duration::hours(3));
        f.scheduler.poll().await;
        assert_eq!(f.scheduler.pending_timers(), 0);
        assert_eq!(f.push.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_follow_up_records_completion() {
        let f = fixture().await;
        f.neutral_pattern().await;
        let task = f
            .insert_task(TaskPriority::Low, f.clock.now() - Duration::hours(1))
            .await;
        f.scheduler.schedule_for_task(task.id).await.unwrap();
        f.scheduler.poll().await; // fires the escalated reminder

        // Child completes 20 minutes after the reminder.
        f.clock.advance(Duration::minutes(20));
        f.repo
            .patch(
                collections::TASKS,
                &task.id.to_string(),
                json!({ "status": "completed", "completed_at": f.clock.now().to_rfc3339() }),
            )
            .await
            .unwrap();

        // Follow-up check at +30 minutes.
        f.clock.advance(Duration::minutes(10));
        f.scheduler.poll().await;

        let pattern: ReminderPattern = f
            .repo
            .get(collections::PATTERNS, &f.child_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert!((pattern.completion_rate - (0.9 * 0.5 + 0.1)).abs() < 1e-9);
        assert!((pattern.avg_response_minutes - (0.8 * 45.0 + 0.2 * 20.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_follow_up_records_non_response() {
        let f = fixture().await;
        f.neutral_pattern().await;
        let task = f
            .insert_task(TaskPriority::Low, f.clock.now() - Duration::hours(1))
            .await;
        f.scheduler.schedule_for_task(task.id).await.unwrap();
        f.scheduler.poll().await;

        f.clock.advance(Duration::minutes(30));
        f.scheduler.poll().await;

        let pattern: ReminderPattern = f
            .repo
            .get(collections::PATTERNS, &f.child_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert!((pattern.completion_rate - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_schedule_rejects_task_without_due_date() {
        let f = fixture().await;
        let mut task = f
            .insert_task(TaskPriority::Low, f.clock.now() + Duration::hours(5))
            .await;
        task.due_at = None;
        f.repo
            .put(collections::TASKS, &task.id.to_string(), &task)
            .await
            .unwrap();
        let err = f.scheduler.schedule_for_task(task.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_schedule_rejects_parent_assignee() {
        let f = fixture().await;
        let parent_id = Uuid::new_v4();
        let parent = FamilyMember {
            id: parent_id,
            family_id: f.family_id,
            display_name: "Sam".to_string(),
            role: FamilyRole::Parent,
            points: 0,
            current_streak: 0,
            device_token: None,
        };
        f.repo
            .put(collections::MEMBERS, &parent_id.to_string(), &parent)
            .await
            .unwrap();
        let mut task = f
            .insert_task(TaskPriority::Low, f.clock.now() + Duration::hours(5))
            .await;
        task.assigned_to = parent_id;
        f.repo
            .put(collections::TASKS, &task.id.to_string(), &task)
            .await
            .unwrap();
        let err = f.scheduler.schedule_for_task(task.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
