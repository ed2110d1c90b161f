//! Commands that talk to a running builder server.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::path::Path;
use url::Url;

/// The parts of a build snapshot the CLI inspects.
#[derive(Debug, Deserialize)]
struct Summary {
    #[serde(default)]
    token: Option<String>,
    status: String,
    #[serde(default)]
    errors: Vec<String>,
}

impl Summary {
    fn succeeded(&self) -> bool {
        self.status == "success" && self.errors.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// `base` with `segments` appended to its path.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("invalid server URL: {}", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Turn a non-2xx response into an error carrying the server's message.
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    bail!("server returned {}: {}", status, message)
}

async fn get_json(url: Url) -> Result<serde_json::Value> {
    let response = reqwest::get(url.clone())
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    Ok(check(response).await?.json().await?)
}

fn print_snapshot(snapshot: &serde_json::Value) -> Result<Summary> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(Summary::deserialize(snapshot)?)
}

/// Submit a job file. Prints the initial snapshot.
pub async fn submit(api_url: &Url, job_path: &Path) -> Result<()> {
    let body = tokio::fs::read(job_path)
        .await
        .with_context(|| format!("Failed to read job file: {}", job_path.display()))?;
    let url = endpoint(api_url, &["builds"])?;

    let response = reqwest::Client::new()
        .post(url.clone())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let snapshot: serde_json::Value = check(response).await?.json().await?;

    let summary = print_snapshot(&snapshot)?;
    if let Some(token) = summary.token {
        eprintln!("Submitted build {}", token);
    }
    Ok(())
}

pub async fn status(api_url: &Url, token: &str) -> Result<()> {
    let snapshot = get_json(endpoint(api_url, &["builds", token])?).await?;
    print_snapshot(&snapshot)?;
    Ok(())
}

/// Wait for the build to finish. Returns whether it succeeded.
pub async fn wait(api_url: &Url, token: &str) -> Result<bool> {
    let snapshot = get_json(endpoint(api_url, &["builds", token, "wait"])?).await?;
    let summary = print_snapshot(&snapshot)?;
    Ok(summary.succeeded())
}

pub async fn output(api_url: &Url, token: &str) -> Result<()> {
    let url = endpoint(api_url, &["builds", token, "output"])?;
    let response = reqwest::get(url.clone())
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let text = check(response).await?.text().await?;
    print!("{}", text);
    Ok(())
}

pub async fn cancel(api_url: &Url, token: &str) -> Result<()> {
    let url = endpoint(api_url, &["builds", token])?;
    let response = reqwest::Client::new()
        .delete(url.clone())
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    check(response).await?;
    eprintln!("Cancelling build {}", token);
    Ok(())
}
