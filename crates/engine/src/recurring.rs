//! Recurring task generation.
//!
//! Parents register templates ("dishes every weekday at 17:00"); a
//! periodic tick materializes a concrete task whenever a template's
//! `next_run_at` arrives, then recomputes the next occurrence. A template
//! that missed several occurrences during an outage materializes once and
//! skips the backlog.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use domain::models::{
    next_occurrence, RecurrenceRule, ScheduledTaskTemplate, Task, TaskCategory, TaskPriority,
    TaskStatus,
};
use domain::services::Clock;

use crate::error::EngineError;
use crate::repo::{collections, Repo};
use store::Filter;

/// Validated input for registering a recurring task template.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub struct NewTemplate {
    pub family_id: Uuid,
    pub child_id: Uuid,
    #[validate(length(min = 1, max = 200, message = "must be 1-200 characters"))]
    pub title: String,
    pub category: TaskCategory,
    pub priority: TaskPriority,
    #[validate(range(min = 0, max = 1000, message = "must be between 0 and 1000"))]
    pub points: i64,
    #[serde(default)]
    pub requires_photo: bool,
    pub rule: RecurrenceRule,
}

/// One projected future occurrence of a template.
#[derive(Debug, Clone)]
pub struct UpcomingOccurrence {
    pub template_id: Uuid,
    pub child_id: Uuid,
    pub title: String,
    pub occurs_at: DateTime<Utc>,
}

/// The recurring task generator.
pub struct RecurringGenerator {
    repo: Repo,
    clock: Arc<dyn Clock>,
}

impl RecurringGenerator {
    pub fn new(repo: Repo, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Register a template. The first occurrence is computed immediately.
    pub async fn add_template(
        &self,
        input: NewTemplate,
    ) -> Result<ScheduledTaskTemplate, EngineError> {
        input.validate()?;
        let child = self.repo.require_child(input.child_id).await?;
        if child.family_id != input.family_id {
            return Err(EngineError::InvalidInput(format!(
                "child {} does not belong to family {}",
                input.child_id, input.family_id
            )));
        }

        let now = self.clock.now();
        let template = ScheduledTaskTemplate {
            id: Uuid::new_v4(),
            family_id: input.family_id,
            child_id: input.child_id,
            title: input.title,
            category: input.category,
            priority: input.priority,
            points: input.points,
            requires_photo: input.requires_photo,
            rule: input.rule.clone(),
            next_run_at: next_occurrence(now, &input.rule),
            active: true,
            created_at: now,
        };
        self.repo
            .put(collections::TEMPLATES, &template.id.to_string(), &template)
            .await?;
        info!(
            template_id = %template.id,
            child_id = %template.child_id,
            next_run_at = %template.next_run_at,
            "Recurring template registered"
        );
        Ok(template)
    }

    /// Deactivate a template. Already materialized tasks are unaffected.
    pub async fn deactivate(&self, template_id: Uuid) -> Result<(), EngineError> {
        let exists: Option<ScheduledTaskTemplate> = self
            .repo
            .get(collections::TEMPLATES, &template_id.to_string())
            .await?;
        if exists.is_none() {
            return Err(EngineError::NotFound(format!("template {}", template_id)));
        }
        self.repo
            .patch(
                collections::TEMPLATES,
                &template_id.to_string(),
                serde_json::json!({ "active": false }),
            )
            .await?;
        Ok(())
    }

    /// Materialize every due template. Returns the tasks created.
    ///
    /// Due-ness is decided on parsed timestamps rather than in the store
    /// query, so documents with mixed timestamp precision compare
    /// correctly.
    pub async fn tick(&self) -> Result<Vec<Task>, EngineError> {
        let now = self.clock.now();
        let templates: Vec<(String, ScheduledTaskTemplate)> = self
            .repo
            .query(collections::TEMPLATES, &[Filter::eq("active", true)])
            .await?;

        let mut created = Vec::new();
        for (id, template) in templates {
            if !template.is_due(now) {
                continue;
            }
            match self.materialize(&template, now).await {
                Ok(task) => created.push(task),
                Err(e) => {
                    warn!(template_id = %id, error = %e, "Materialization failed");
                }
            }
        }
        Ok(created)
    }

    /// Project future occurrences of active templates over `days`.
    pub async fn upcoming(&self, days: i64) -> Result<Vec<UpcomingOccurrence>, EngineError> {
        let now = self.clock.now();
        let cutoff = now + Duration::days(days.max(0));
        let templates: Vec<(String, ScheduledTaskTemplate)> = self
            .repo
            .query(collections::TEMPLATES, &[Filter::eq("active", true)])
            .await?;

        let mut occurrences = Vec::new();
        for (_, template) in templates {
            let mut at = if template.next_run_at > now {
                template.next_run_at
            } else {
                next_occurrence(now, &template.rule)
            };
            // Bounded: a daily rule yields one entry per projected day.
            while at <= cutoff {
                occurrences.push(UpcomingOccurrence {
                    template_id: template.id,
                    child_id: template.child_id,
                    title: template.title.clone(),
                    occurs_at: at,
                });
                at = next_occurrence(at, &template.rule);
            }
        }
        occurrences.sort_by_key(|o| o.occurs_at);
        Ok(occurrences)
    }

    async fn materialize(
        &self,
        template: &ScheduledTaskTemplate,
        now: DateTime<Utc>,
    ) -> Result<Task, EngineError> {
        // Due on the tick day at the template's configured time-of-day,
        // regardless of how stale next_run_at was.
        let due_at = now
            .date_naive()
            .and_time(template.rule.time_of_day)
            .and_utc();
        let task = Task {
            id: Uuid::new_v4(),
            family_id: template.family_id,
            title: template.title.clone(),
            category: template.category,
            assigned_to: template.child_id,
            points: template.points,
            requires_photo: template.requires_photo,
            priority: template.priority,
            status: TaskStatus::Pending,
            due_at: Some(due_at),
            escalation_level: 0,
            created_at: now,
            completed_at: None,
        };
        self.repo
            .put(collections::TASKS, &task.id.to_string(), &task)
            .await?;

        // Skip any backlog: the next run is computed from now, not from
        // the occurrence just served.
        let next_run_at = next_occurrence(now, &template.rule);
        self.repo
            .patch(
                collections::TEMPLATES,
                &template.id.to_string(),
                serde_json::json!({ "next_run_at": next_run_at.to_rfc3339() }),
            )
            .await?;
        counter!("recurring_tasks_created_total").increment(1);
        info!(
            template_id = %template.id,
            task_id = %task.id,
            due_at = %due_at,
            next_run_at = %next_run_at,
            "Recurring task materialized"
        );
        Ok(task)
    }
}
