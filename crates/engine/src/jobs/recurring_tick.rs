//! Periodic recurring-template materialization job.

use std::sync::Arc;

use tracing::info;

use crate::jobs::scheduler::{Job, JobFrequency};
use crate::recurring::RecurringGenerator;

pub struct RecurringTickJob {
    generator: Arc<RecurringGenerator>,
    interval_secs: u64,
}

impl RecurringTickJob {
    pub fn new(generator: Arc<RecurringGenerator>, interval_secs: u64) -> Self {
        Self {
            generator,
            interval_secs,
        }
    }
}

#[async_trait::async_trait]
impl Job for RecurringTickJob {
    fn name(&self) -> &'static str {
        "recurring_tick"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(self.interval_secs)
    }

    async fn execute(&self) -> Result<(), String> {
        let created = self.generator.tick().await.map_err(|e| e.to_string())?;
        if !created.is_empty() {
            info!(created = created.len(), "Recurring tasks materialized");
        }
        Ok(())
    }
}
