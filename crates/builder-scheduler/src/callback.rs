//! Completion callbacks.

use builder_core::{BuildSnapshot, Error, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Posts final build snapshots to callback URLs.
///
/// Delivery is best effort: one attempt per URL, failures are logged and
/// never retried.
#[derive(Debug, Clone)]
pub struct CallbackNotifier {
    client: reqwest::Client,
}

impl CallbackNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("simple-builder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("building http client: {}", e)))?;
        Ok(Self { client })
    }

    /// POST `snapshot` as JSON to `url`.
    pub async fn notify(&self, url: &str, snapshot: &BuildSnapshot) -> reqwest::Result<()> {
        self.client
            .post(url)
            .json(snapshot)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Notify every URL in order. Returns how many deliveries succeeded.
    pub async fn notify_all(&self, urls: &[String], snapshot: &BuildSnapshot) -> usize {
        let mut delivered = 0;
        for url in urls {
            info!(callback = %url, "Sending build callback");
            match self.notify(url, snapshot).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(callback = %url, error = %e, "Build callback failed"),
            }
        }
        delivered
    }
}
