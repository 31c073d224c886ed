//! Demo binary: runs the engine against an in-memory store with a mock
//! push sender, seeded with a small family so the background jobs have
//! something to chew on. Delivery is logged, not sent.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveTime, Utc};
use tracing::info;
use uuid::Uuid;

use domain::models::{
    FamilyMember, FamilyRole, RecurrenceKind, RecurrenceRule, Task, TaskCategory, TaskPriority,
    TaskStatus,
};
use domain::services::{MockPushSender, SystemClock};
use family_tasks_engine::recurring::NewTemplate;
use family_tasks_engine::repo::{collections, Repo};
use family_tasks_engine::{logging, Engine, EngineConfig};
use store::MemoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = EngineConfig::load()?;
    logging::init_logging(&config.logging);

    info!("Starting Family Tasks engine v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(MemoryStore::new());
    let push = Arc::new(MockPushSender::new());
    let clock = Arc::new(SystemClock);
    let engine = Arc::new(Engine::new(config, store.clone(), push, clock));

    let (family_id, child_id) = seed_demo_family(&Repo::new(store)).await?;
    engine.initialize(family_id).await?;

    engine
        .add_recurring_task(NewTemplate {
            family_id,
            child_id,
            title: "Feed the cat".to_string(),
            category: TaskCategory::Chore,
            priority: TaskPriority::Low,
            points: 5,
            requires_photo: false,
            rule: RecurrenceRule {
                kind: RecurrenceKind::Daily,
                days_of_week: vec![],
                time_of_day: NaiveTime::from_hms_opt(17, 0, 0)
                    .ok_or_else(|| anyhow::anyhow!("invalid seed time"))?,
            },
        })
        .await?;

    let upcoming = engine.get_upcoming_tasks(7).await?;
    info!(
        due = upcoming.due.len(),
        projected = upcoming.projected.len(),
        "Upcoming week"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    engine.dispose().await;
    Ok(())
}

/// One parent, one child, a task due tonight, and an already-overdue task.
async fn seed_demo_family(repo: &Repo) -> Result<(Uuid, Uuid)> {
    let now = Utc::now();
    let family_id = Uuid::new_v4();
    let parent_id = Uuid::new_v4();
    let child_id = Uuid::new_v4();

    for member in [
        FamilyMember {
            id: parent_id,
            family_id,
            display_name: "Alex".to_string(),
            role: FamilyRole::Parent,
            points: 0,
            current_streak: 0,
            device_token: Some("demo-parent-device".to_string()),
        },
        FamilyMember {
            id: child_id,
            family_id,
            display_name: "Robin".to_string(),
            role: FamilyRole::Child,
            points: 25,
            current_streak: 4,
            device_token: Some("demo-child-device".to_string()),
        },
    ] {
        repo.put(collections::MEMBERS, &member.id.to_string(), &member)
            .await?;
    }

    for (title, category, due_in_hours, points) in [
        ("Take out the trash", TaskCategory::Chore, 6i64, 10i64),
        ("Math homework", TaskCategory::Homework, -2, 15),
    ] {
        let task = Task {
            id: Uuid::new_v4(),
            family_id,
            title: title.to_string(),
            category,
            assigned_to: child_id,
            points,
            requires_photo: false,
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            due_at: Some(now + Duration::hours(due_in_hours)),
            escalation_level: 0,
            created_at: now,
            completed_at: None,
        };
        repo.put(collections::TASKS, &task.id.to_string(), &task)
            .await?;
    }

    info!(family_id = %family_id, "Demo family seeded");
    Ok((family_id, child_id))
}
