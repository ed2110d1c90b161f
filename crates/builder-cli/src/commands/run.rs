//! Local single-job execution command.

use anyhow::{Context, Result};
use builder_core::{BuildRequest, BuildSnapshot, BuildToken};
use builder_executor::LocalExecutor;
use builder_scheduler::registry::SCRATCH_PREFIX;
use builder_scheduler::shutdown::install_shutdown_handler;
use builder_scheduler::{BuildRunner, CallbackNotifier};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub builds_dir: PathBuf,
    pub force_recursive_clone: bool,
    pub keep: bool,
}

/// Run the job in `job_path` to completion. Ctrl-C or SIGTERM cancels it.
/// Returns whether the build finished without errors.
pub async fn run_job(job_path: &Path, options: RunOptions) -> Result<bool> {
    let content = tokio::fs::read(job_path)
        .await
        .with_context(|| format!("Failed to read job file: {}", job_path.display()))?;
    let request = BuildRequest::from_json(&content)
        .with_context(|| format!("Invalid job file: {}", job_path.display()))?;

    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;
    let snapshot = execute(request, &options, &shutdown).await?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(snapshot.succeeded())
}

async fn execute(
    request: BuildRequest,
    options: &RunOptions,
    shutdown: &CancellationToken,
) -> Result<BuildSnapshot> {
    tokio::fs::create_dir_all(&options.builds_dir)
        .await
        .with_context(|| format!("Failed to create {}", options.builds_dir.display()))?;

    let token = BuildToken::generate();
    let root = options
        .builds_dir
        .join(format!("{}{}", SCRATCH_PREFIX, token));
    tokio::fs::create_dir(&root)
        .await
        .with_context(|| format!("Failed to create {}", root.display()))?;

    let runner = BuildRunner::new(Arc::new(LocalExecutor::new()))
        .force_recursive_clone(options.force_recursive_clone)
        .tail_output(true);

    let BuildRequest {
        descriptor,
        callbacks,
    } = request;

    let build = match runner.start(token, descriptor, root.clone(), shutdown).await {
        Ok(build) => build,
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&root).await;
            return Err(e).context("Failed to start build");
        }
    };

    let snapshot = build.done().await;

    if !callbacks.is_empty() {
        let notifier = CallbackNotifier::new(CALLBACK_TIMEOUT)?;
        let delivered = notifier.notify_all(&callbacks, &snapshot).await;
        info!(delivered, total = callbacks.len(), "Callbacks attempted");
    }

    if options.keep {
        info!(root = %root.display(), "Keeping scratch directory");
    } else if let Err(e) = tokio::fs::remove_dir_all(&root).await {
        warn!(root = %root.display(), error = %e, "Failed to remove scratch directory");
    }

    for error in &snapshot.errors {
        warn!(error = %error, "Build error");
    }
    info!(status = %snapshot.status, "Build finished");

    Ok(snapshot)
}
