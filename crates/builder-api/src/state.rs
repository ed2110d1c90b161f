//! Application state.

use builder_scheduler::{Build, BuildRegistry};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BuildRegistry>,
    /// The one build served under `/build` in single-build mode. Held here so
    /// it stays reachable after the registry evicts it.
    pub single_build: Option<Arc<Build>>,
}

impl AppState {
    pub fn new(registry: Arc<BuildRegistry>) -> Self {
        Self {
            registry,
            single_build: None,
        }
    }

    /// Serve only `build`: `/build/wait` and `/build/output` resolve to it
    /// and no new builds are accepted.
    pub fn single(registry: Arc<BuildRegistry>, build: Arc<Build>) -> Self {
        Self {
            registry,
            single_build: Some(build),
        }
    }
}
