//! Notification scheduling and escalation engine for the Family Tasks app.
//!
//! The engine watches a document store of tasks, family members, and
//! preferences, and turns task lifecycle changes into push notifications:
//! a dispatch queue with preference filtering and rate limiting, a
//! monotonic escalation ladder for overdue tasks, adaptive smart
//! reminders, and a recurring-task generator. See [`engine::Engine`] for
//! the entry point.

pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod jobs;
pub mod logging;
pub mod queue;
pub mod recurring;
pub mod reminders;
pub mod repo;
pub mod timers;

pub use config::EngineConfig;
pub use engine::{Engine, UpcomingTasks};
pub use error::EngineError;
