//! Collaborator service traits consumed by the engine.

pub mod clock;
pub mod push;

pub use clock::{Clock, ManualClock, SystemClock};
pub use push::{MockPushSender, PushOutcome, PushSender, SentPush};
