//! The engine context object.
//!
//! One `Engine` owns the dispatch queue, escalation state machine,
//! reminder scheduler, and recurring generator, wires them to the
//! document-store change feed, and runs the periodic jobs. Hosts construct
//! it from collaborator trait objects and call the public operations; no
//! global state is involved, so tests run engines side by side.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use domain::models::{
    default_levels, default_rules, EventKind, NotificationEvent, NotificationKey,
    NotificationRule, RecipientRole, ReminderPattern, Task, TriggerContext,
    UserNotificationPreferences,
};
use domain::services::{Clock, PushSender};
use store::{ChangeEvent, ChangeKind, DocumentStore, Filter};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::escalation::{EscalationEngine, EscalationSummary};
use crate::jobs::{
    EscalationSweepJob, JobScheduler, QueueDrainJob, RecurringTickJob, ReminderDriveJob,
};
use crate::queue::DispatchQueue;
use crate::recurring::{NewTemplate, RecurringGenerator, UpcomingOccurrence};
use crate::reminders::{ReminderPlan, ReminderScheduler};
use crate::repo::{collections, Repo};

/// Pending tasks due soon plus projected recurring occurrences.
#[derive(Debug)]
pub struct UpcomingTasks {
    /// Pending tasks due within the window, soonest first.
    pub due: Vec<Task>,
    /// Future recurring occurrences within the window.
    pub projected: Vec<UpcomingOccurrence>,
}

struct Background {
    scheduler: JobScheduler,
    watcher: JoinHandle<()>,
}

/// The notification scheduling and escalation engine.
pub struct Engine {
    repo: Repo,
    clock: Arc<dyn Clock>,
    queue: Arc<DispatchQueue>,
    escalation: Arc<EscalationEngine>,
    reminders: Arc<ReminderScheduler>,
    recurring: Arc<RecurringGenerator>,
    config: EngineConfig,
    /// Active rule set: built-in defaults overridden by stored rules.
    rules: RwLock<Vec<NotificationRule>>,
    families: Mutex<HashSet<Uuid>>,
    background: Mutex<Option<Background>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        push: Arc<dyn PushSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let repo = Repo::new(store);
        let rules = default_rules();
        let queue = Arc::new(DispatchQueue::new(
            repo.clone(),
            push,
            clock.clone(),
            config.queue.clone(),
        ));
        let escalation_rule = rule_for(&rules, EventKind::Escalation);
        let reminder_rule = rule_for(&rules, EventKind::TaskReminder);
        let escalation = Arc::new(EscalationEngine::new(
            repo.clone(),
            queue.clone(),
            clock.clone(),
            default_levels(),
            escalation_rule,
        ));
        let reminders = Arc::new(ReminderScheduler::new(
            repo.clone(),
            queue.clone(),
            clock.clone(),
            reminder_rule,
            config.reminders.follow_up_minutes,
        ));
        let recurring = Arc::new(RecurringGenerator::new(repo.clone(), clock.clone()));

        Self {
            repo,
            clock,
            queue,
            escalation,
            reminders,
            recurring,
            config,
            rules: RwLock::new(rules),
            families: Mutex::new(HashSet::new()),
            background: Mutex::new(None),
        }
    }

    /// Bring a family under management. Idempotent per family.
    ///
    /// The first call also starts the background jobs and the change-feed
    /// consumer. Per family it seeds default notification preferences for
    /// members without one, schedules reminders for pending tasks, and
    /// runs an initial escalation pass.
    pub async fn initialize(self: &Arc<Self>, family_id: Uuid) -> Result<(), EngineError> {
        {
            let mut families = self.families.lock().await;
            if families.contains(&family_id) {
                debug!(family_id = %family_id, "Family already initialized");
                return Ok(());
            }
            families.insert(family_id);
        }

        self.refresh_rules().await?;
        self.start_background().await;

        let members: Vec<(String, domain::models::FamilyMember)> = self
            .repo
            .query(
                collections::MEMBERS,
                &[Filter::eq("family_id", family_id.to_string())],
            )
            .await?;
        for (id, member) in &members {
            let existing: Option<UserNotificationPreferences> =
                self.repo.get(collections::PREFERENCES, id).await?;
            if existing.is_none() {
                self.repo
                    .put(
                        collections::PREFERENCES,
                        id,
                        &UserNotificationPreferences::default_for(member.id),
                    )
                    .await?;
            }
        }

        let tasks: Vec<(String, Task)> = self
            .repo
            .query(
                collections::TASKS,
                &[
                    Filter::eq("family_id", family_id.to_string()),
                    Filter::eq("status", "pending"),
                ],
            )
            .await?;
        for (_, task) in &tasks {
            if task.due_at.is_some() {
                if let Err(e) = self.reminders.schedule_for_task(task.id).await {
                    warn!(task_id = %task.id, error = %e, "Initial reminder scheduling failed");
                }
            }
            if let Err(e) = self.escalation.check_task(task.id).await {
                warn!(task_id = %task.id, error = %e, "Initial escalation check failed");
            }
        }

        info!(
            family_id = %family_id,
            members = members.len(),
            pending_tasks = tasks.len(),
            "Family initialized"
        );
        Ok(())
    }

    /// Resolve the rule for an event, evaluate its conditions, and admit
    /// it to the queue for the rule's recipient roles.
    ///
    /// Returns the keys admitted; an event whose conditions are not met
    /// admits nothing.
    pub async fn queue_notification(
        &self,
        event: NotificationEvent,
    ) -> Result<Vec<NotificationKey>, EngineError> {
        let rule = {
            let rules = self.rules.read().await;
            rules
                .iter()
                .find(|r| r.kind == event.kind())
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("rule for {}", event.kind())))?
        };

        let (child, task) = self.subjects_of(&event).await?;
        let ctx = self.trigger_context(&child, task.as_ref()).await?;
        if let Some(conditions) = &rule.conditions {
            if !conditions.satisfied(&ctx) {
                debug!(kind = %rule.kind, "Conditions not met; notification suppressed");
                return Ok(Vec::new());
            }
        }

        let mut recipients = Vec::new();
        if matches!(rule.recipients, RecipientRole::Child | RecipientRole::Both) {
            recipients.push(child.id);
        }
        if matches!(rule.recipients, RecipientRole::Parent | RecipientRole::Both) {
            for parent in self.repo.parents_of(child.family_id).await? {
                recipients.push(parent.id);
            }
        }

        Ok(self
            .queue
            .enqueue(&rule, &event, &recipients, self.clock.now())
            .await)
    }

    /// Apply any warranted escalation transitions to one task.
    pub async fn check_task_escalation(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<domain::models::EscalationRecord>, EngineError> {
        self.escalation.check_task(task_id).await
    }

    /// Resolve a task's escalations and stop its future reminders.
    pub async fn resolve_escalation(&self, task_id: Uuid) -> Result<usize, EngineError> {
        self.reminders.stop_reminders(task_id);
        self.escalation.resolve(task_id).await
    }

    /// Classify and register reminders for a task.
    pub async fn schedule_smart_reminder(
        &self,
        task_id: Uuid,
    ) -> Result<ReminderPlan, EngineError> {
        self.reminders.schedule_for_task(task_id).await
    }

    /// Register a recurring task template.
    pub async fn add_recurring_task(
        &self,
        input: NewTemplate,
    ) -> Result<domain::models::ScheduledTaskTemplate, EngineError> {
        self.recurring.add_template(input).await
    }

    /// Pending tasks due within `days` plus projected recurring
    /// occurrences.
    pub async fn get_upcoming_tasks(&self, days: i64) -> Result<UpcomingTasks, EngineError> {
        let now = self.clock.now();
        let cutoff = now + chrono::Duration::days(days.max(0));
        let mut due: Vec<Task> = self
            .repo
            .pending_tasks()
            .await?
            .into_iter()
            .filter(|t| t.due_at.is_some_and(|d| d <= cutoff))
            .collect();
        due.sort_by_key(|t| t.due_at);
        let projected = self.recurring.upcoming(days).await?;
        Ok(UpcomingTasks { due, projected })
    }

    /// Escalation snapshot for one family.
    pub async fn get_escalation_summary(
        &self,
        family_id: Uuid,
        days: i64,
    ) -> Result<EscalationSummary, EngineError> {
        self.escalation.summary(family_id, days).await
    }

    /// Stop jobs and the change-feed consumer, and drop pending timers.
    /// Idempotent.
    pub async fn dispose(&self) {
        let background = self.background.lock().await.take();
        if let Some(background) = background {
            background.scheduler.shutdown();
            background
                .scheduler
                .wait_for_shutdown(StdDuration::from_secs(10))
                .await;
            background.watcher.abort();
        }
        self.reminders.clear();
        info!("Engine disposed");
    }

    /// Immediately drain the dispatch queue. Exposed for hosts that want
    /// delivery ahead of the next drain job tick.
    pub async fn drain_now(&self) -> crate::queue::DrainStats {
        self.queue.drain().await
    }

    async fn start_background(self: &Arc<Self>) {
        let mut slot = self.background.lock().await;
        if slot.is_some() {
            return;
        }

        let mut scheduler = JobScheduler::new();
        scheduler.register(QueueDrainJob::new(
            self.queue.clone(),
            self.config.queue.drain_interval_secs,
        ));
        if self.config.escalation.enabled {
            scheduler.register(EscalationSweepJob::new(
                self.escalation.clone(),
                self.config.escalation.sweep_interval_mins,
            ));
        }
        scheduler.register(RecurringTickJob::new(
            self.recurring.clone(),
            self.config.recurring.tick_interval_secs,
        ));
        scheduler.register(ReminderDriveJob::new(
            self.reminders.clone(),
            self.config.reminders.poll_interval_secs,
        ));
        scheduler.start();

        let watcher = tokio::spawn(run_change_feed(
            self.clone(),
            self.repo.store().watch(),
        ));
        *slot = Some(Background { scheduler, watcher });
    }

    /// Overlay stored rules onto the built-in defaults, by kind.
    async fn refresh_rules(&self) -> Result<(), EngineError> {
        let stored: Vec<(String, NotificationRule)> =
            self.repo.query(collections::RULES, &[]).await?;
        if stored.is_empty() {
            return Ok(());
        }
        let mut rules = self.rules.write().await;
        for (_, rule) in stored {
            match rules.iter_mut().find(|r| r.kind == rule.kind) {
                Some(existing) => *existing = rule,
                None => rules.push(rule),
            }
        }
        Ok(())
    }

    /// The child (and task, when the event has one) an event is about.
    async fn subjects_of(
        &self,
        event: &NotificationEvent,
    ) -> Result<(domain::models::FamilyMember, Option<Task>), EngineError> {
        if let Some(task_id) = event.task_id() {
            let task = self
                .repo
                .task(task_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))?;
            let child = self
                .repo
                .member(task.assigned_to)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("member {}", task.assigned_to)))?;
            return Ok((child, Some(task)));
        }
        let child_id = match event {
            NotificationEvent::StreakMilestone { child_id, .. }
            | NotificationEvent::HabitFormed { child_id, .. } => *child_id,
            _ => {
                return Err(EngineError::InvalidInput(
                    "event carries neither task nor child".to_string(),
                ))
            }
        };
        let child = self
            .repo
            .member(child_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("member {}", child_id)))?;
        Ok((child, None))
    }

    async fn trigger_context(
        &self,
        child: &domain::models::FamilyMember,
        task: Option<&Task>,
    ) -> Result<TriggerContext, EngineError> {
        let pattern: Option<ReminderPattern> = self
            .repo
            .get(collections::PATTERNS, &child.id.to_string())
            .await?;
        Ok(TriggerContext {
            streak: Some(child.current_streak),
            hours_overdue: task.and_then(|t| t.hours_overdue(self.clock.now())),
            completion_rate: pattern.map(|p| p.completion_rate),
        })
    }

    /// Credit a completed task's points once. Returns whether this call
    /// performed the credit.
    async fn credit_completion(&self, task: &Task) -> Result<bool, EngineError> {
        let existing: Vec<(String, domain::models::PointLedgerEntry)> = self
            .repo
            .query(
                collections::LEDGER,
                &[Filter::eq("task_id", task.id.to_string())],
            )
            .await?;
        if existing.iter().any(|(_, e)| e.delta > 0) {
            return Ok(false);
        }

        let now = self.clock.now();
        if task.points > 0 {
            let entry = domain::models::PointLedgerEntry {
                id: Uuid::new_v4(),
                child_id: task.assigned_to,
                task_id: Some(task.id),
                delta: task.points,
                reason: format!("completed \"{}\"", task.title),
                created_at: now,
            };
            self.repo
                .put(collections::LEDGER, &entry.id.to_string(), &entry)
                .await?;
            if let Some(member) = self.repo.member(task.assigned_to).await? {
                self.repo
                    .patch(
                        collections::MEMBERS,
                        &task.assigned_to.to_string(),
                        serde_json::json!({ "points": member.points + task.points }),
                    )
                    .await?;
            }
        }
        Ok(true)
    }

    /// React to one task document change from the store feed.
    async fn on_task_change(&self, kind: ChangeKind, task: Task) {
        match kind {
            ChangeKind::Removed => {
                self.reminders.cancel_for_task(task.id);
            }
            ChangeKind::Added | ChangeKind::Modified => {
                if task.is_pending() {
                    if task.due_at.is_some() {
                        if let Err(e) = self.reminders.schedule_for_task(task.id).await {
                            warn!(task_id = %task.id, error = %e, "Reminder scheduling failed");
                        }
                    }
                    if let Err(e) = self.escalation.check_task(task.id).await {
                        warn!(task_id = %task.id, error = %e, "Escalation check failed");
                    }
                    if kind == ChangeKind::Added {
                        self.announce(&task, EventKind::TaskCreated).await;
                    }
                } else if task.completed_at.is_some() {
                    self.reminders.stop_reminders(task.id);
                    if let Err(e) = self.escalation.resolve(task.id).await {
                        warn!(task_id = %task.id, error = %e, "Escalation resolve failed");
                    }
                    match self.credit_completion(&task).await {
                        Ok(true) => self.announce(&task, EventKind::TaskCompleted).await,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(task_id = %task.id, error = %e, "Completion credit failed");
                        }
                    }
                }
            }
        }
    }

    /// Emit a lifecycle notification for a task, eating errors: feed
    /// handling must never die on a notification failure.
    async fn announce(&self, task: &Task, kind: EventKind) {
        let child_name = match self.repo.member(task.assigned_to).await {
            Ok(Some(member)) => member.display_name,
            _ => return,
        };
        let event = match kind {
            EventKind::TaskCreated => NotificationEvent::TaskCreated {
                task_id: task.id,
                task_title: task.title.clone(),
                child_name,
            },
            EventKind::TaskCompleted => NotificationEvent::TaskCompleted {
                task_id: task.id,
                task_title: task.title.clone(),
                child_name,
                points: task.points,
            },
            _ => return,
        };
        if let Err(e) = self.queue_notification(event).await {
            warn!(task_id = %task.id, error = %e, "Lifecycle notification failed");
        }
    }
}

fn rule_for(rules: &[NotificationRule], kind: EventKind) -> NotificationRule {
    rules
        .iter()
        .find(|r| r.kind == kind)
        .cloned()
        .unwrap_or_else(|| NotificationRule {
            // The built-in set covers every kind; this fallback only keeps
            // a misconfigured custom set from panicking.
            id: Uuid::new_v4(),
            kind,
            severity: domain::models::Severity::Medium,
            recipients: RecipientRole::Both,
            conditions: None,
            title_template: "Notification".to_string(),
            body_template: "{taskTitle}".to_string(),
        })
}

/// Consume the store change feed and route task changes into the engine.
async fn run_change_feed(
    engine: Arc<Engine>,
    mut rx: tokio::sync::broadcast::Receiver<ChangeEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                // The next sweep re-reads state, so lag is survivable.
                warn!(missed = missed, "Change feed lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        if event.collection != collections::TASKS {
            continue;
        }
        match serde_json::from_value::<Task>(event.doc.clone()) {
            Ok(task) => engine.on_task_change(event.kind, task).await,
            Err(e) => {
                warn!(id = %event.id, error = %e, "Undeserializable task in change feed");
            }
        }
    }
    debug!("Change feed consumer stopped");
}
