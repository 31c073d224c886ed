//! Engine configuration.
//!
//! Loaded from layered files plus `FT__`-prefixed environment variables.
//! Every interval the engine runs on is configurable; the defaults are the
//! production cadences (30 s queue drain, 5 min escalation sweep, 1 min
//! recurring tick).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub recurring: RecurringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Seconds between queue drain passes.
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,

    /// Delivery attempts before an entry is evicted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Hours a send timestamp stays in the rolling rate-limit window.
    #[serde(default = "default_send_window_hours")]
    pub send_window_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Minutes between full escalation sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_mins: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    /// Seconds between timer-wheel polls.
    #[serde(default = "default_reminder_poll")]
    pub poll_interval_secs: u64,

    /// Minutes after a reminder fires at which the response check runs.
    #[serde(default = "default_follow_up")]
    pub follow_up_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecurringConfig {
    /// Seconds between recurring-template materialization passes.
    #[serde(default = "default_recurring_tick")]
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_drain_interval() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_send_window_hours() -> i64 {
    24
}
fn default_enabled() -> bool {
    true
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_reminder_poll() -> u64 {
    5
}
fn default_follow_up() -> i64 {
    30
}
fn default_recurring_tick() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: default_drain_interval(),
            max_attempts: default_max_attempts(),
            send_window_hours: default_send_window_hours(),
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sweep_interval_mins: default_sweep_interval(),
        }
    }
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_reminder_poll(),
            follow_up_minutes: default_follow_up(),
        }
    }
}

impl Default for RecurringConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_recurring_tick(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Loading order (later sources override earlier):
    /// 1. config/default.toml - base configuration with defaults
    /// 2. config/local.toml - local overrides (optional, not in git)
    /// 3. Environment variables with FT__ prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("FT").separator("__"))
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(config::ConfigError::Message)?;
        Ok(cfg)
    }

    /// Load configuration for testing with custom overrides, without
    /// touching the file system.
    #[cfg(test)]
    pub fn load_for_test(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }
        let config = builder.build()?;
        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(config::ConfigError::Message)?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), String> {
        if self.queue.drain_interval_secs == 0 {
            return Err("queue.drain_interval_secs must be positive".to_string());
        }
        if self.queue.max_attempts == 0 {
            return Err("queue.max_attempts must be at least 1".to_string());
        }
        if self.reminders.follow_up_minutes <= 0 {
            return Err("reminders.follow_up_minutes must be positive".to_string());
        }
        if self.recurring.tick_interval_secs == 0 {
            return Err("recurring.tick_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}
