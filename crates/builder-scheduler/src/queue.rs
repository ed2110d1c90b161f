//! Work queue abstraction.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// A message received from a work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    /// Opaque handle identifying this delivery; required to extend or delete.
    pub receipt_handle: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("queue service error ({status}): {code}: {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    #[error("invalid queue response: {0}")]
    InvalidResponse(String),

    #[error("missing credentials: {0}")]
    Credentials(String),

    #[error("queue misconfigured: {0}")]
    Config(String),
}

/// An at-least-once work queue.
///
/// A received message stays invisible to other consumers for its visibility
/// window. It is redelivered unless deleted before the window runs out.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Long-poll for at most one message.
    async fn receive(&self) -> Result<Option<QueueMessage>, QueueError>;

    /// Restart the visibility window of `message` at `timeout` from now.
    async fn extend_visibility(
        &self,
        message: &QueueMessage,
        timeout: Duration,
    ) -> Result<(), QueueError>;

    /// Remove `message` for good.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;
}
