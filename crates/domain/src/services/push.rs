//! Push delivery collaborator.
//!
//! The engine never talks to a push provider directly; it depends on this
//! trait and treats delivery as a boolean outcome. The mock implementation
//! records every send for assertions and can simulate failures.

use serde_json::Value;

/// Result of a push delivery attempt.
///
/// Failure carries no structured reason beyond a log-friendly message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    Failed(String),
}

impl PushOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, PushOutcome::Sent)
    }
}

/// Push delivery service trait.
#[async_trait::async_trait]
pub trait PushSender: Send + Sync {
    /// Deliver a push message to a device token.
    async fn send(&self, device_token: &str, title: &str, body: &str, data: &Value)
        -> PushOutcome;
}

/// A push message captured by [`MockPushSender`].
#[derive(Debug, Clone)]
pub struct SentPush {
    pub device_token: String,
    pub title: String,
    pub body: String,
    pub data: Value,
}

/// Mock push sender for development and testing.
///
/// Logs sends instead of delivering them, and records them for inspection.
#[derive(Debug, Default)]
pub struct MockPushSender {
    simulate_failure: std::sync::atomic::AtomicBool,
    sent: std::sync::Mutex<Vec<SentPush>>,
}

impl MockPushSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock sender that fails every delivery.
    pub fn failing() -> Self {
        let sender = Self::default();
        sender
            .simulate_failure
            .store(true, std::sync::atomic::Ordering::SeqCst);
        sender
    }

    /// Toggle failure simulation at runtime.
    pub fn set_failing(&self, failing: bool) {
        self.simulate_failure
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Messages delivered so far.
    pub fn sent(&self) -> Vec<SentPush> {
        self.sent.lock().expect("mock push lock poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("mock push lock poisoned").len()
    }
}

#[async_trait::async_trait]
impl PushSender for MockPushSender {
    async fn send(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: &Value,
    ) -> PushOutcome {
        if self
            .simulate_failure
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            tracing::warn!(
                device_token = %device_token,
                title = %title,
                "Mock push sender simulating failure"
            );
            return PushOutcome::Failed("simulated failure".to_string());
        }

        tracing::info!(
            device_token = %device_token,
            title = %title,
            body = %body,
            "Mock: would send push notification"
        );

        self.sent
            .lock()
            .expect("mock push lock poisoned")
            .push(SentPush {
                device_token: device_token.to_string(),
                title: title.to_string(),
                body: body.to_string(),
                data: data.clone(),
            });

        PushOutcome::Sent
    }
}
