//! Simple Builder API server

use anyhow::Context;
use builder_api::{AppState, routes};
use builder_config::{QueueConfig, ServerConfig};
use builder_core::BuildRequest;
use builder_executor::LocalExecutor;
use builder_scheduler::shutdown::install_shutdown_handler;
use builder_scheduler::sigv4::Credentials;
use builder_scheduler::{
    BuildRegistry, LeaseConfig, RegistryConfig, SqsConfig, SqsQueue, Worker,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// How long running builds get to wind down after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "builder-server", version, about = "Runs build jobs submitted over HTTP or a queue")]
struct Args {
    /// KDL configuration file
    #[arg(long, env = "SIMPLE_BUILDER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "SIMPLE_BUILDER_LISTEN")]
    listen: Option<SocketAddr>,

    /// Directory holding the per-build scratch directories
    #[arg(long, env = "SIMPLE_BUILDER_BUILDS_DIR")]
    builds_dir: Option<PathBuf>,

    /// SQS queue URL to consume build requests from
    #[arg(long, env = "SIMPLE_BUILDER_INPUT_SQS")]
    input_sqs: Option<Url>,

    /// AWS region of the queue
    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,

    /// SQS endpoint override
    #[arg(long, env = "SIMPLE_BUILDER_SQS_ENDPOINT")]
    sqs_endpoint: Option<Url>,

    /// Run this job file at startup and serve only it, under `/build`
    #[arg(long, env = "SIMPLE_BUILDER_BUILD_JOB", conflicts_with = "input_sqs")]
    build_job: Option<PathBuf>,

    /// Mirror build logs into the server log
    #[arg(long)]
    tail_output: bool,

    /// Clone submodules for every build
    #[arg(long)]
    force_recursive_clone: bool,

    /// Emit logs as JSON
    #[arg(long, env = "SIMPLE_BUILDER_LOG_JSON")]
    log_json: bool,
}

/// Defaults, then the config file, then flags and environment.
fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(dir) = &args.builds_dir {
        config.builds_dir = dir.clone();
    }
    if args.tail_output {
        config.tail_output = true;
    }
    if args.force_recursive_clone {
        config.force_recursive_clone = true;
    }
    if let Some(url) = &args.input_sqs {
        let queue = config
            .queue
            .get_or_insert_with(|| QueueConfig::new(url.clone()));
        queue.url = url.clone();
    }
    if let Some(queue) = config.queue.as_mut() {
        if let Some(region) = &args.aws_region {
            queue.region = Some(region.clone());
        }
        if let Some(endpoint) = &args.sqs_endpoint {
            queue.endpoint = Some(endpoint.clone());
        }
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;
    let shutdown = install_shutdown_handler().context("installing signal handlers")?;

    info!(builds_dir = %config.builds_dir.display(), "Preparing builds directory");
    tokio::fs::create_dir_all(&config.builds_dir)
        .await
        .with_context(|| format!("creating {}", config.builds_dir.display()))?;

    let registry = Arc::new(BuildRegistry::new(
        RegistryConfig {
            builds_dir: config.builds_dir.clone(),
            tail_output: config.tail_output,
            force_recursive_clone: config.force_recursive_clone,
            callback_timeout: config.callback_timeout,
        },
        Arc::new(LocalExecutor::new()),
        shutdown.child_token(),
    )?);

    let worker = match &config.queue {
        Some(queue) => {
            let region = queue
                .region()
                .context("queue region is not configured")?;
            info!(queue = %queue.url, %region, "Consuming build requests from SQS");
            let sqs = SqsQueue::new(
                SqsConfig {
                    queue_url: queue.url.clone(),
                    region,
                    endpoint: queue.endpoint.clone(),
                    wait_time: queue.wait_time,
                    visibility_timeout: queue.visibility_timeout,
                },
                Credentials::from_env()?,
            )?;
            let worker = Worker::new(
                Arc::new(sqs),
                registry.clone(),
                LeaseConfig {
                    visibility_timeout: queue.visibility_timeout,
                    refresh_interval: queue.refresh_interval,
                    ..Default::default()
                },
            );
            let cancel = shutdown.clone();
            Some(tokio::spawn(async move { worker.run(cancel).await }))
        }
        None => None,
    };

    let state = match &args.build_job {
        Some(path) => {
            let content = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading build job {}", path.display()))?;
            let request = BuildRequest::from_json(&content)
                .with_context(|| format!("invalid build job {}", path.display()))?;
            let (build, token) = registry.create_build(request).await?;
            info!(%token, "Serving a single build under /build");
            AppState::single(registry.clone(), build)
        }
        None => AppState::new(registry.clone()),
    };

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.listen);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await?;

    registry.shutdown();
    if let Some(worker) = worker {
        let _ = worker.await;
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = registry.len(), "Builds still running at exit");
    }

    info!("Server stopped");
    Ok(())
}
