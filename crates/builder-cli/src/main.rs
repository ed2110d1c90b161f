//! Simple Builder CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use url::Url;

mod commands;

#[derive(Parser)]
#[command(name = "builder")]
#[command(about = "Simple Builder - run untrusted build jobs", long_about = None)]
#[command(version)]
struct Cli {
    /// Builder server URL
    #[arg(long, env = "SIMPLE_BUILDER_URL", default_value = "http://localhost:8080")]
    api_url: Url,

    /// Emit logs as JSON
    #[arg(long, env = "SIMPLE_BUILDER_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single job locally and exit with its result
    Run {
        /// Job file: a build descriptor plus optional callbacks, as JSON
        #[arg(long)]
        job: PathBuf,

        /// Directory to create the scratch directory in
        #[arg(long, env = "SIMPLE_BUILDER_BUILDS_DIR")]
        builds_dir: Option<PathBuf>,

        /// Clone submodules regardless of the job
        #[arg(long)]
        force_recursive_clone: bool,

        /// Leave the scratch directory in place afterwards
        #[arg(long)]
        keep: bool,
    },

    /// Submit a job file to the server
    Submit {
        /// Job file
        job: PathBuf,
    },

    /// Show the current state of a build
    Status { token: String },

    /// Block until a build finishes and show its final state
    Wait { token: String },

    /// Print a build's log so far
    Output { token: String },

    /// Cancel a running build
    Cancel { token: String },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            job,
            builds_dir,
            force_recursive_clone,
            keep,
        } => {
            let options = commands::run::RunOptions {
                builds_dir: builds_dir
                    .unwrap_or_else(|| std::env::temp_dir().join("simple-builder")),
                force_recursive_clone,
                keep,
            };
            let succeeded = commands::run::run_job(&job, options).await?;
            return Ok(if succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Commands::Submit { job } => {
            commands::client::submit(&cli.api_url, &job).await?;
        }
        Commands::Status { token } => {
            commands::client::status(&cli.api_url, &token).await?;
        }
        Commands::Wait { token } => {
            let succeeded = commands::client::wait(&cli.api_url, &token).await?;
            if !succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Output { token } => {
            commands::client::output(&cli.api_url, &token).await?;
        }
        Commands::Cancel { token } => {
            commands::client::cancel(&cli.api_url, &token).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["builder", "run", "--job", "job.json", "--keep"]);
        match cli.command {
            Commands::Run { job, keep, .. } => {
                assert_eq!(job, PathBuf::from("job.json"));
                assert!(keep);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_client_commands() {
        let cli = Cli::parse_from([
            "builder",
            "--api-url",
            "http://builder.internal:9000",
            "wait",
            "abc",
        ]);
        assert_eq!(cli.api_url.as_str(), "http://builder.internal:9000/");
        assert!(matches!(cli.command, Commands::Wait { token } if token == "abc"));
    }
}
