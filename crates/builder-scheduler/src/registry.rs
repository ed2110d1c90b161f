//! Registry of in-flight builds.

use builder_core::{BuildRequest, BuildToken, Error, Result};
use builder_executor::Executor;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::CallbackNotifier;
use crate::orchestrator::{Build, BuildRunner};

/// Prefix of every build's scratch directory name.
pub const SCRATCH_PREFIX: &str = "simple-builder-";

/// How many fresh tokens to try before giving up on a scratch directory.
const TOKEN_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub builds_dir: PathBuf,
    pub tail_output: bool,
    pub force_recursive_clone: bool,
    pub callback_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            builds_dir: std::env::temp_dir().join("simple-builder"),
            tail_output: false,
            force_recursive_clone: false,
            callback_timeout: Duration::from_secs(30),
        }
    }
}

type BuildMap = HashMap<BuildToken, Arc<Build>>;

/// Token-addressed builds that have not completed yet.
///
/// Each build gets a waiter task that, once the build completes, posts the
/// final snapshot to the request's callbacks and then evicts the build. The
/// map lock is only held for single map operations.
pub struct BuildRegistry {
    builds: Arc<Mutex<BuildMap>>,
    runner: BuildRunner,
    notifier: CallbackNotifier,
    builds_dir: PathBuf,
    shutdown: CancellationToken,
}

impl BuildRegistry {
    /// Create a registry whose builds run under `shutdown`.
    pub fn new(
        config: RegistryConfig,
        executor: Arc<dyn Executor>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let runner = BuildRunner::new(executor)
            .force_recursive_clone(config.force_recursive_clone)
            .tail_output(config.tail_output);
        Ok(Self {
            builds: Arc::new(Mutex::new(HashMap::new())),
            runner,
            notifier: CallbackNotifier::new(config.callback_timeout)?,
            builds_dir: config.builds_dir,
            shutdown,
        })
    }

    pub fn builds_dir(&self) -> &Path {
        &self.builds_dir
    }

    /// Start a build for `request` and return it with its token.
    ///
    /// Returns as soon as the build is running; completion is observed via
    /// [`Build::done`].
    pub async fn create_build(&self, request: BuildRequest) -> Result<(Arc<Build>, BuildToken)> {
        request.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (token, root) = self.allocate().await?;
        let BuildRequest {
            descriptor,
            callbacks,
        } = request;

        let build = match self
            .runner
            .start(token.clone(), descriptor, root.clone(), &self.shutdown)
            .await
        {
            Ok(build) => build,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&root).await;
                return Err(e);
            }
        };

        lock(&self.builds).insert(token.clone(), build.clone());
        self.spawn_waiter(build.clone(), callbacks);

        Ok((build, token))
    }

    /// Pick an unused token and create its scratch directory. Directory
    /// creation is the reservation: it fails if the name is taken.
    async fn allocate(&self) -> Result<(BuildToken, PathBuf)> {
        tokio::fs::create_dir_all(&self.builds_dir)
            .await
            .map_err(|e| Error::Io(format!("{}: {}", self.builds_dir.display(), e)))?;

        for _ in 0..TOKEN_ATTEMPTS {
            let token = BuildToken::generate();
            if self.contains(&token) {
                continue;
            }
            let root = self.builds_dir.join(format!("{}{}", SCRATCH_PREFIX, token));
            let mut dir = tokio::fs::DirBuilder::new();
            #[cfg(unix)]
            dir.mode(0o700);
            match dir.create(&root).await {
                Ok(()) => return Ok((token, root)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::Io(format!("{}: {}", root.display(), e))),
            }
        }
        Err(Error::Internal("could not allocate a unique build token".into()))
    }

    fn spawn_waiter(&self, build: Arc<Build>, callbacks: Vec<String>) {
        let builds = self.builds.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let snapshot = build.done().await;
            let token = build.token().clone();

            if !callbacks.is_empty() {
                let delivered = notifier.notify_all(&callbacks, &snapshot).await;
                debug!(%token, delivered, total = callbacks.len(), "Callbacks attempted");
            }

            lock(&builds).remove(&token);

            if snapshot.errors.is_empty() {
                info!(%token, "Build succeeded");
            } else {
                for error in &snapshot.errors {
                    warn!(%token, error = %error, "Build error");
                }
            }
            debug!(%token, output = %snapshot.output, "Build output");
        });
    }

    pub fn get(&self, token: &BuildToken) -> Option<Arc<Build>> {
        lock(&self.builds).get(token).cloned()
    }

    /// Look up `token`, failing with [`Error::NotFound`].
    pub fn find(&self, token: &BuildToken) -> Result<Arc<Build>> {
        self.get(token)
            .ok_or_else(|| Error::NotFound(format!("build {}", token)))
    }

    pub fn contains(&self, token: &BuildToken) -> bool {
        lock(&self.builds).contains_key(token)
    }

    /// Number of builds not yet evicted.
    pub fn len(&self) -> usize {
        lock(&self.builds).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every running build and refuse new ones.
    pub fn shutdown(&self) {
        info!(running = self.len(), "Shutting down build registry");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for BuildRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRegistry")
            .field("builds", &self.len())
            .field("builds_dir", &self.builds_dir)
            .finish()
    }
}

/// The map stays consistent across a panicking holder, so poisoning is
/// ignored.
fn lock(builds: &Mutex<BuildMap>) -> MutexGuard<'_, BuildMap> {
    builds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
