//! Worker that consumes build requests from a work queue.

use builder_core::BuildRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::Build;
use crate::queue::{QueueMessage, WorkQueue};
use crate::registry::BuildRegistry;

/// Lease timing of received messages.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    /// Visibility window requested on every extension.
    pub visibility_timeout: Duration,
    /// Time between extensions; shorter than `visibility_timeout`.
    pub refresh_interval: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Long-polls a queue and starts a build for every message.
///
/// Each message is handled on its own task, which keeps the message leased
/// until the build completes and then deletes it. On shutdown the message is
/// left alone so another consumer picks it up once its window expires.
pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    registry: Arc<BuildRegistry>,
    lease: LeaseConfig,
}

impl Worker {
    pub fn new(queue: Arc<dyn WorkQueue>, registry: Arc<BuildRegistry>, lease: LeaseConfig) -> Self {
        Self {
            queue,
            registry,
            lease,
        }
    }

    /// Run the intake loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting queue worker");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    info!(message_id = %message.id, "Received build request");
                    let queue = self.queue.clone();
                    let registry = self.registry.clone();
                    let lease = self.lease;
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        handle_message(queue, registry, lease, message, cancel).await;
                    });
                }
                Ok(None) => {
                    // Long poll expired without a message.
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive from queue");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.lease.error_backoff) => {}
                    }
                }
            }
        }

        info!("Queue worker stopped");
    }
}

async fn handle_message(
    queue: Arc<dyn WorkQueue>,
    registry: Arc<BuildRegistry>,
    lease: LeaseConfig,
    message: QueueMessage,
    cancel: CancellationToken,
) {
    // Undecodable messages stay queued and come back after their window.
    let request = match BuildRequest::from_json(message.body.as_bytes()) {
        Ok(request) => request,
        Err(e) => {
            warn!(message_id = %message.id, error = %e, "Dropping undecodable build request");
            return;
        }
    };

    let build = match registry.create_build(request).await {
        Ok((build, token)) => {
            info!(message_id = %message.id, %token, "Started build from queue");
            build
        }
        Err(e) => {
            warn!(message_id = %message.id, error = %e, "Failed to start build");
            return;
        }
    };

    hold_lease(queue.as_ref(), &message, &build, lease, &cancel).await;
}

/// Keep `message` invisible while `build` runs, then delete it.
/// Returns without deleting when `cancel` fires first.
pub async fn hold_lease(
    queue: &dyn WorkQueue,
    message: &QueueMessage,
    build: &Build,
    lease: LeaseConfig,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(message_id = %message.id, token = %build.token(), "Shutting down, leaving message on the queue");
                return;
            }
            _ = build.done() => {
                match queue.delete(message).await {
                    Ok(()) => debug!(message_id = %message.id, "Deleted queue message"),
                    Err(e) => warn!(message_id = %message.id, error = %e, "Failed to delete queue message"),
                }
                return;
            }
            _ = sleep(lease.refresh_interval) => {
                match queue.extend_visibility(message, lease.visibility_timeout).await {
                    Ok(()) => debug!(message_id = %message.id, "Extended message visibility"),
                    Err(e) => warn!(message_id = %message.id, error = %e, "Failed to extend message visibility"),
                }
            }
        }
    }
}
