//! Periodic escalation sweep job.
//!
//! The event-driven path catches task updates as they happen; this sweep
//! is the backstop that finds tasks whose overdue thresholds passed
//! silently.

use std::sync::Arc;

use tracing::info;

use crate::escalation::EscalationEngine;
use crate::jobs::scheduler::{Job, JobFrequency};

pub struct EscalationSweepJob {
    engine: Arc<EscalationEngine>,
    interval_mins: u64,
}

impl EscalationSweepJob {
    pub fn new(engine: Arc<EscalationEngine>, interval_mins: u64) -> Self {
        Self {
            engine,
            interval_mins,
        }
    }
}

#[async_trait::async_trait]
impl Job for EscalationSweepJob {
    fn name(&self) -> &'static str {
        "escalation_sweep"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(self.interval_mins)
    }

    async fn execute(&self) -> Result<(), String> {
        let transitions = self.engine.sweep().await.map_err(|e| e.to_string())?;
        if transitions > 0 {
            info!(transitions = transitions, "Escalation sweep applied transitions");
        }
        Ok(())
    }
}
