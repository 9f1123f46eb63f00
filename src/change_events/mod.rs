mod bus;
mod models;
mod outbox;
mod publisher;
mod retry_policy;

pub use bus::{HttpMessageBus, LogMessageBus, MessageBus, PublishError, RecordingMessageBus};
pub use models::*;
pub use outbox::OutboxStore;
pub use publisher::{prune_published, DeliveryOutcome, OutboxPublisher, RoundStats};
pub use retry_policy::{RetryDecision, RetryPolicy};
