//! Domain layer for the Family Tasks notification engine.
//!
//! This crate contains:
//! - Domain models (tasks, notification rules, escalation levels, reminder
//!   patterns, recurrence templates)
//! - Pure scheduling arithmetic (quiet hours, recurrence, strategy selection)
//! - Collaborator service traits (push delivery, clock)

pub mod models;
pub mod services;
