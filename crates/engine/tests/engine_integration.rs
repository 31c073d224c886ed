//! End-to-end flow through the public engine API: a family is brought
//! under management, an overdue task escalates via the change feed, the
//! queue delivers the resulting notifications, and completion resolves
//! everything.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use uuid::Uuid;

use domain::models::{
    FamilyMember, FamilyRole, Task, TaskCategory, TaskPriority, TaskStatus,
};
use domain::services::{Clock, ManualClock, MockPushSender};
use family_tasks_engine::repo::{collections, Repo};
use family_tasks_engine::{Engine, EngineConfig};
use store::MemoryStore;

struct Harness {
    engine: Arc<Engine>,
    repo: Repo,
    push: Arc<MockPushSender>,
    clock: Arc<ManualClock>,
    family_id: Uuid,
    child_id: Uuid,
    parent_id: Uuid,
}

async fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::new());
    let push = Arc::new(MockPushSender::new());
    // Tighten the reminder poll so timer-driven paths resolve within the
    // test's wait window.
    let mut config = EngineConfig::default();
    config.reminders.poll_interval_secs = 1;
    let engine = Arc::new(Engine::new(
        config,
        store.clone(),
        push.clone(),
        clock.clone(),
    ));
    let repo = Repo::new(store);

    let family_id = Uuid::new_v4();
    let child_id = Uuid::new_v4();
    let parent_id = Uuid::new_v4();
    for (id, role, name) in [
        (child_id, FamilyRole::Child, "Mia"),
        (parent_id, FamilyRole::Parent, "Sam"),
    ] {
        let member = FamilyMember {
            id,
            family_id,
            display_name: name.to_string(),
            role,
            points: 0,
            current_streak: 0,
            device_token: Some(format!("tok-{}", id)),
        };
        repo.put(collections::MEMBERS, &id.to_string(), &member)
            .await
            .unwrap();
    }

    Harness {
        engine,
        repo,
        push,
        clock,
        family_id,
        child_id,
        parent_id,
    }
}

impl Harness {
    fn overdue_task(&self, hours: i64) -> Task {
        let now = self.clock.now();
        Task {
            id: Uuid::new_v4(),
            family_id: self.family_id,
            title: "Math homework".to_string(),
            category: TaskCategory::Homework,
            assigned_to: self.child_id,
            points: 15,
            requires_photo: false,
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            due_at: Some(now - Duration::hours(hours)),
            escalation_level: 0,
            created_at: now - Duration::hours(hours + 1),
            completed_at: None,
        }
    }

    async fn wait_for<F, Fut>(&self, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..250 {
            if check().await {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        panic!("condition not reached within timeout");
    }
}

#[tokio::test]
async fn test_overdue_lifecycle_end_to_end() {
    let h = harness().await;
    h.engine.initialize(h.family_id).await.unwrap();

    // Insert a task four hours overdue; the change feed escalates it to
    // level 2 (thresholds 1 h and 3 h crossed).
    let mut task = h.overdue_task(4);
    h.repo
        .put(collections::TASKS, &task.id.to_string(), &task)
        .await
        .unwrap();
    h.wait_for(|| async {
        h.repo
            .task(task.id)
            .await
            .unwrap()
            .map(|t| t.escalation_level == 2)
            .unwrap_or(false)
    })
    .await;

    let summary = h
        .engine
        .get_escalation_summary(h.family_id, 7)
        .await
        .unwrap();
    assert_eq!(summary.active_records.len(), 2);

    // Level 1 notified the child, level 2 both; draining delivers them.
    let stats = h.engine.drain_now().await;
    assert!(stats.delivered >= 1);
    let sent = h.push.sent();
    assert!(sent
        .iter()
        .any(|p| p.device_token == format!("tok-{}", h.parent_id)));

    // Completion resolves the escalations and credits the points.
    task.status = TaskStatus::Completed;
    task.completed_at = Some(h.clock.now());
    h.repo
        .put(collections::TASKS, &task.id.to_string(), &task)
        .await
        .unwrap();
    h.wait_for(|| async {
        h.engine
            .get_escalation_summary(h.family_id, 7)
            .await
            .unwrap()
            .active_records
            .is_empty()
    })
    .await;
    h.wait_for(|| async {
        h.repo
            .member(h.child_id)
            .await
            .unwrap()
            .map(|m| m.points == 15)
            .unwrap_or(false)
    })
    .await;

    h.engine.dispose().await;
}

#[tokio::test]
async fn test_smart_reminder_delivery_end_to_end() {
    let h = harness().await;
    h.engine.initialize(h.family_id).await.unwrap();

    // An overdue task gets the escalated cadence, whose single reminder
    // is due immediately.
    let task = h.overdue_task(1);
    h.repo
        .put(collections::TASKS, &task.id.to_string(), &task)
        .await
        .unwrap();

    let plan = h.engine.schedule_smart_reminder(task.id).await.unwrap();
    assert!(!plan.scheduled.is_empty());

    // The reminder drive job picks the timer up on its next poll; drain
    // repeatedly until the rendered reminder reaches the push sender.
    h.wait_for(|| async {
        h.engine.drain_now().await;
        h.push
            .sent()
            .iter()
            .any(|p| p.body.contains("right now"))
    })
    .await;

    h.engine.dispose().await;
}
