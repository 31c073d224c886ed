//! Periodic queue drain job.

use std::sync::Arc;

use tracing::info;

use crate::jobs::scheduler::{Job, JobFrequency};
use crate::queue::DispatchQueue;

pub struct QueueDrainJob {
    queue: Arc<DispatchQueue>,
    interval_secs: u64,
}

impl QueueDrainJob {
    pub fn new(queue: Arc<DispatchQueue>, interval_secs: u64) -> Self {
        Self {
            queue,
            interval_secs,
        }
    }
}

#[async_trait::async_trait]
impl Job for QueueDrainJob {
    fn name(&self) -> &'static str {
        "queue_drain"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(self.interval_secs)
    }

    async fn execute(&self) -> Result<(), String> {
        let stats = self.queue.drain().await;
        if stats.delivered + stats.failed + stats.evicted > 0 {
            info!(
                delivered = stats.delivered,
                failed = stats.failed,
                evicted = stats.evicted,
                "Queue drained"
            );
        }
        Ok(())
    }
}
