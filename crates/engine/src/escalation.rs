//! Escalation state machine for overdue tasks.
//!
//! Every pending task carries a monotonic escalation level. A periodic
//! sweep (and targeted checks after task updates) compares hours overdue
//! against the ladder thresholds and walks the task up one level at a
//! time, executing each level's actions as it passes through. Levels never
//! go down; completing the task resolves all of its escalation records and
//! lifts any device restriction it caused.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use domain::models::{
    DeviceRestriction, EscalationAction, EscalationLevel, EscalationRecord, FamilyMember,
    NotificationEvent, NotificationRule, PointLedgerEntry, Task,
};
use domain::services::Clock;

use crate::error::EngineError;
use crate::queue::DispatchQueue;
use crate::repo::{collections, Repo};
use store::Filter;

/// Snapshot of a family's escalation state.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationSummary {
    pub family_id: Uuid,
    /// Unresolved records, newest first.
    pub active_records: Vec<EscalationRecord>,
    /// Unresolved record counts keyed by level.
    pub counts_by_level: BTreeMap<u32, usize>,
    /// Records resolved within the requested lookback window.
    pub resolved_in_window: usize,
    /// Restrictions still in force at the time of the query.
    pub active_restrictions: Vec<DeviceRestriction>,
}

/// The escalation state machine.
pub struct EscalationEngine {
    repo: Repo,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    levels: Vec<EscalationLevel>,
    /// Base rule for escalation notifications; each level overrides the
    /// severity and body with its own.
    rule: NotificationRule,
}

impl EscalationEngine {
    pub fn new(
        repo: Repo,
        queue: Arc<DispatchQueue>,
        clock: Arc<dyn Clock>,
        levels: Vec<EscalationLevel>,
        rule: NotificationRule,
    ) -> Self {
        Self {
            repo,
            queue,
            clock,
            levels,
            rule,
        }
    }

    /// Check one task against the ladder and apply any level transitions.
    ///
    /// Returns the records written, one per level crossed. Tasks that are
    /// not pending, have no due date, or are already at or above the
    /// warranted level are left untouched.
    pub async fn check_task(&self, task_id: Uuid) -> Result<Vec<EscalationRecord>, EngineError> {
        let task = self
            .repo
            .task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))?;
        self.check_loaded(&task).await
    }

    /// Run the ladder over every pending task. Failures on individual
    /// tasks are logged and do not abort the sweep.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let tasks = self.repo.pending_tasks().await?;
        let mut transitions = 0;
        for task in tasks {
            match self.check_loaded(&task).await {
                Ok(records) => transitions += records.len(),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Escalation check failed");
                }
            }
        }
        Ok(transitions)
    }

    async fn check_loaded(&self, task: &Task) -> Result<Vec<EscalationRecord>, EngineError> {
        let now = self.clock.now();
        let Some(hours) = task.hours_overdue(now) else {
            return Ok(Vec::new());
        };

        let Some(target) = self
            .levels
            .iter()
            .filter(|l| l.hours_overdue <= hours)
            .map(|l| l.level)
            .max()
        else {
            return Ok(Vec::new());
        };
        // Monotonic: never step down, never repeat a level.
        if target <= task.escalation_level {
            debug!(
                task_id = %task.id,
                level = task.escalation_level,
                "Task already at or above warranted level"
            );
            return Ok(Vec::new());
        }

        let child = self
            .repo
            .member(task.assigned_to)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("member {}", task.assigned_to)))?;

        let mut records = Vec::new();
        // Walk up one level at a time so every intermediate level's
        // actions run and leave a record, even after a long outage.
        for next in (task.escalation_level + 1)..=target {
            let Some(level) = self.levels.iter().find(|l| l.level == next) else {
                continue;
            };
            let mut actions_taken = Vec::new();
            for action in &level.actions {
                match action {
                    EscalationAction::NotifyChild
                    | EscalationAction::NotifyParent
                    | EscalationAction::NotifyBoth => {
                        self.notify(task, &child, level, hours, *action).await?;
                    }
                    EscalationAction::ReducePoints => {
                        self.reduce_points(task, &child, level).await?;
                    }
                    EscalationAction::RestrictDevice => {
                        self.restrict_device(task, level).await?;
                    }
                }
                actions_taken.push(*action);
            }

            let record = EscalationRecord {
                id: Uuid::new_v4(),
                task_id: task.id,
                child_id: task.assigned_to,
                family_id: task.family_id,
                level: next,
                actions_taken,
                escalated_at: now,
                resolved: false,
                resolved_at: None,
            };
            self.repo
                .put(collections::ESCALATIONS, &record.id.to_string(), &record)
                .await?;
            self.repo
                .patch(
                    collections::TASKS,
                    &task.id.to_string(),
                    json!({ "escalation_level": next }),
                )
                .await?;
            counter!("escalations_total").increment(1);
            info!(
                task_id = %task.id,
                level = next,
                name = %level.name,
                "Task escalated"
            );
            records.push(record);
        }
        Ok(records)
    }

    /// Resolve every open escalation for a completed task and lift the
    /// restrictions it caused. Returns the number of records resolved.
    pub async fn resolve(&self, task_id: Uuid) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let open: Vec<(String, EscalationRecord)> = self
            .repo
            .query(
                collections::ESCALATIONS,
                &[
                    Filter::eq("task_id", task_id.to_string()),
                    Filter::eq("resolved", false),
                ],
            )
            .await?;
        let resolved = open.len();
        for (id, _) in &open {
            self.repo
                .patch(
                    collections::ESCALATIONS,
                    id,
                    json!({ "resolved": true, "resolved_at": now.to_rfc3339() }),
                )
                .await?;
        }

        let restrictions: Vec<(String, DeviceRestriction)> = self
            .repo
            .query(
                collections::RESTRICTIONS,
                &[
                    Filter::eq("task_id", task_id.to_string()),
                    Filter::eq("lifted", false),
                ],
            )
            .await?;
        for (id, _) in &restrictions {
            self.repo
                .patch(collections::RESTRICTIONS, id, json!({ "lifted": true }))
                .await?;
        }

        // Reset the denormalized level; point reductions are kept.
        if resolved > 0 && self.repo.task(task_id).await?.is_some() {
            self.repo
                .patch(
                    collections::TASKS,
                    &task_id.to_string(),
                    json!({ "escalation_level": 0 }),
                )
                .await?;
        }

        if resolved > 0 {
            info!(
                task_id = %task_id,
                records = resolved,
                restrictions = restrictions.len(),
                "Escalation resolved"
            );
        }
        Ok(resolved)
    }

    /// Current escalation state for a family, with resolved records counted
    /// over the trailing `days`.
    pub async fn summary(
        &self,
        family_id: Uuid,
        days: i64,
    ) -> Result<EscalationSummary, EngineError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::days(days.max(0));
        let records: Vec<EscalationRecord> = self
            .repo
            .query::<EscalationRecord>(
                collections::ESCALATIONS,
                &[Filter::eq("family_id", family_id.to_string())],
            )
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .collect();

        let mut active_records: Vec<EscalationRecord> =
            records.iter().filter(|r| !r.resolved).cloned().collect();
        active_records.sort_by(|a, b| b.escalated_at.cmp(&a.escalated_at));
        let resolved_in_window = records
            .iter()
            .filter(|r| r.resolved && r.escalated_at >= cutoff)
            .count();

        let mut counts_by_level = BTreeMap::new();
        for record in &active_records {
            *counts_by_level.entry(record.level).or_insert(0) += 1;
        }

        let restrictions: Vec<DeviceRestriction> = self
            .repo
            .query::<DeviceRestriction>(collections::RESTRICTIONS, &[])
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_active(now))
            .collect();
        let child_ids: Vec<Uuid> = active_records.iter().map(|r| r.child_id).collect();
        let mut active_restrictions: Vec<DeviceRestriction> = Vec::new();
        for restriction in restrictions {
            let in_family = child_ids.contains(&restriction.child_id)
                || match self.repo.member(restriction.child_id).await? {
                    Some(member) => member.family_id == family_id,
                    None => false,
                };
            if in_family {
                active_restrictions.push(restriction);
            }
        }

        Ok(EscalationSummary {
            family_id,
            active_records,
            counts_by_level,
            resolved_in_window,
            active_restrictions,
        })
    }

    async fn notify(
        &self,
        task: &Task,
        child: &FamilyMember,
        level: &EscalationLevel,
        hours: f64,
        action: EscalationAction,
    ) -> Result<(), EngineError> {
        let mut recipients = Vec::new();
        if matches!(
            action,
            EscalationAction::NotifyChild | EscalationAction::NotifyBoth
        ) {
            recipients.push(child.id);
        }
        if matches!(
            action,
            EscalationAction::NotifyParent | EscalationAction::NotifyBoth
        ) {
            for parent in self.repo.parents_of(task.family_id).await? {
                recipients.push(parent.id);
            }
        }

        let mut rule = self.rule.clone();
        rule.severity = level.severity;
        rule.body_template = level.message_template.clone();
        let event = NotificationEvent::Escalation {
            task_id: task.id,
            task_title: task.title.clone(),
            child_name: child.display_name.clone(),
            level: level.level,
            hours,
        };
        self.queue
            .enqueue(&rule, &event, &recipients, self.clock.now())
            .await;
        Ok(())
    }

    async fn reduce_points(
        &self,
        task: &Task,
        child: &FamilyMember,
        level: &EscalationLevel,
    ) -> Result<(), EngineError> {
        if level.point_penalty <= 0 {
            return Ok(());
        }
        let entry = PointLedgerEntry {
            id: Uuid::new_v4(),
            child_id: child.id,
            task_id: Some(task.id),
            delta: -level.point_penalty,
            reason: format!("escalation level {} on \"{}\"", level.level, task.title),
            created_at: self.clock.now(),
        };
        self.repo
            .put(collections::LEDGER, &entry.id.to_string(), &entry)
            .await?;

        // Cached total floors at zero; the ledger keeps the true history.
        let current = self
            .repo
            .member(child.id)
            .await?
            .map(|m| m.points)
            .unwrap_or(child.points);
        let new_total = (current - level.point_penalty).max(0);
        self.repo
            .patch(
                collections::MEMBERS,
                &child.id.to_string(),
                json!({ "points": new_total }),
            )
            .await?;
        info!(
            child_id = %child.id,
            penalty = level.point_penalty,
            points = new_total,
            "Points reduced by escalation"
        );
        Ok(())
    }

    async fn restrict_device(
        &self,
        task: &Task,
        level: &EscalationLevel,
    ) -> Result<(), EngineError> {
        let restriction = DeviceRestriction::new(
            task.assigned_to,
            task.id,
            level.restricted_capabilities.clone(),
            self.clock.now(),
        );
        self.repo
            .put(
                collections::RESTRICTIONS,
                &restriction.id.to_string(),
                &restriction,
            )
            .await?;
        counter!("device_restrictions_total").increment(1);
        warn!(
            child_id = %task.assigned_to,
            task_id = %task.id,
            "Device restriction applied"
        );
        Ok(())
    }
}
