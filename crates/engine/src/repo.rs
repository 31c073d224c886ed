//! Typed access to the document-store collaborator.
//!
//! Documents are stored as JSON and round-trip through serde here, keeping
//! the components free of raw `Value` plumbing. A handful of domain lookups
//! (task, member, parents of a family) live here because several components
//! share them.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use domain::models::{FamilyMember, FamilyRole, Task};
use store::{DocumentStore, Filter};

use crate::error::EngineError;

/// Collection names used by the engine.
pub mod collections {
    pub const TASKS: &str = "tasks";
    pub const MEMBERS: &str = "members";
    pub const PREFERENCES: &str = "notification_preferences";
    pub const ESCALATIONS: &str = "escalations";
    pub const RESTRICTIONS: &str = "device_restrictions";
    pub const LEDGER: &str = "point_ledger";
    pub const PATTERNS: &str = "reminder_patterns";
    pub const TEMPLATES: &str = "task_templates";
    pub const RULES: &str = "notification_rules";
}

/// Typed wrapper around the document store.
#[derive(Clone)]
pub struct Repo {
    store: Arc<dyn DocumentStore>,
}

impl Repo {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, EngineError> {
        match self.store.get(collection, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn query<T: DeserializeOwned>(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<(String, T)>, EngineError> {
        let docs = self.store.query(collection, filters).await?;
        let mut out = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            match serde_json::from_value(doc) {
                Ok(value) => out.push((id, value)),
                Err(e) => {
                    // A malformed document must not poison the whole scan.
                    tracing::warn!(
                        collection = collection,
                        id = %id,
                        error = %e,
                        "Skipping undeserializable document"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Insert or replace under a caller-chosen id.
    pub async fn put<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        value: &T,
    ) -> Result<(), EngineError> {
        let doc = serde_json::to_value(value)?;
        self.store.set(collection, id, doc).await?;
        Ok(())
    }

    pub async fn add<T: Serialize>(
        &self,
        collection: &str,
        value: &T,
    ) -> Result<String, EngineError> {
        let doc = serde_json::to_value(value)?;
        Ok(self.store.add(collection, doc).await?)
    }

    pub async fn patch(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<(), EngineError> {
        self.store.update(collection, id, patch).await?;
        Ok(())
    }

    // Shared domain lookups.

    pub async fn task(&self, id: Uuid) -> Result<Option<Task>, EngineError> {
        self.get(collections::TASKS, &id.to_string()).await
    }

    pub async fn member(&self, id: Uuid) -> Result<Option<FamilyMember>, EngineError> {
        self.get(collections::MEMBERS, &id.to_string()).await
    }

    /// All parents of a family.
    pub async fn parents_of(&self, family_id: Uuid) -> Result<Vec<FamilyMember>, EngineError> {
        let members: Vec<(String, FamilyMember)> = self
            .query(
                collections::MEMBERS,
                &[
                    Filter::eq("family_id", family_id.to_string()),
                    Filter::eq("role", "parent"),
                ],
            )
            .await?;
        Ok(members.into_iter().map(|(_, m)| m).collect())
    }

    /// All pending tasks, across all families.
    pub async fn pending_tasks(&self) -> Result<Vec<Task>, EngineError> {
        let tasks: Vec<(String, Task)> = self
            .query(collections::TASKS, &[Filter::eq("status", "pending")])
            .await?;
        Ok(tasks.into_iter().map(|(_, t)| t).collect())
    }

    /// Verify a member exists and has the child role.
    pub async fn require_child(&self, id: Uuid) -> Result<FamilyMember, EngineError> {
        let member = self
            .member(id)
            .await?
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown child: {}", id)))?;
        if member.role != FamilyRole::Child {
            return Err(EngineError::InvalidInput(format!(
                "member {} is not a child",
                id
            )));
        }
        Ok(member)
    }
}
