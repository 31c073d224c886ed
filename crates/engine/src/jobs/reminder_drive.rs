//! Timer-wheel drive job for reminders.
//!
//! One short-interval poll replaces a per-reminder OS timer; the wheel
//! itself decides what is due.

use std::sync::Arc;

use tracing::debug;

use crate::jobs::scheduler::{Job, JobFrequency};
use crate::reminders::ReminderScheduler;

pub struct ReminderDriveJob {
    scheduler: Arc<ReminderScheduler>,
    interval_secs: u64,
}

impl ReminderDriveJob {
    pub fn new(scheduler: Arc<ReminderScheduler>, interval_secs: u64) -> Self {
        Self {
            scheduler,
            interval_secs,
        }
    }
}

#[async_trait::async_trait]
impl Job for ReminderDriveJob {
    fn name(&self) -> &'static str {
        "reminder_drive"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(self.interval_secs)
    }

    async fn execute(&self) -> Result<(), String> {
        let fired = self.scheduler.poll().await;
        if fired > 0 {
            debug!(fired = fired, "Reminder timers fired");
        }
        Ok(())
    }
}
