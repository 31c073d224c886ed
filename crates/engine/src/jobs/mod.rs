//! Background jobs: the periodic half of the engine.
//!
//! Four jobs drive everything that is not event-triggered: the queue
//! drain, the escalation sweep, the recurring-template tick, and the
//! timer-wheel poll for reminders.

pub mod escalation_sweep;
pub mod queue_drain;
pub mod recurring_tick;
pub mod reminder_drive;
pub mod scheduler;

pub use escalation_sweep::EscalationSweepJob;
pub use queue_drain::QueueDrainJob;
pub use recurring_tick::RecurringTickJob;
pub use reminder_drive::ReminderDriveJob;
pub use scheduler::{Job, JobFrequency, JobScheduler};
