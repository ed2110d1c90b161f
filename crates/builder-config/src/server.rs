//! Server configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Longest long-poll SQS accepts.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Server-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Root under which every build gets its own scratch directory.
    pub builds_dir: PathBuf,
    /// Mirror build logs into the process log while builds run.
    pub tail_output: bool,
    /// Clone submodules for every build, whatever the descriptor says.
    pub force_recursive_clone: bool,
    /// Timeout of a single callback delivery.
    pub callback_timeout: Duration,
    /// Work queue to consume builds from, if any.
    pub queue: Option<QueueConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            builds_dir: std::env::temp_dir().join("simple-builder"),
            tail_output: false,
            force_recursive_clone: false,
            callback_timeout: Duration::from_secs(30),
            queue: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with the KDL file at `path`.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_server_config(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.callback_timeout.is_zero() {
            return Err(ConfigError::invalid("callback-timeout", "must be positive"));
        }
        if let Some(queue) = &self.queue {
            queue.validate()?;
        }
        Ok(())
    }
}

/// Queue consumer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub url: Url,
    /// Signing region. Derived from the queue host when absent.
    pub region: Option<String>,
    /// Service endpoint override, e.g. a local SQS emulator.
    pub endpoint: Option<Url>,
    /// Long-poll duration of one receive.
    pub wait_time: Duration,
    /// Visibility window requested for each received message.
    pub visibility_timeout: Duration,
    /// How often a leased message's visibility is extended.
    pub refresh_interval: Duration,
}

impl QueueConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            region: None,
            endpoint: None,
            wait_time: MAX_WAIT_TIME,
            visibility_timeout: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(30),
        }
    }

    /// Configured region, or the one in an `sqs.<region>.amazonaws.com` or
    /// `<region>.queue.amazonaws.com` host.
    pub fn region(&self) -> Option<String> {
        if let Some(region) = self.region.as_ref().filter(|r| !r.is_empty()) {
            return Some(region.clone());
        }
        let host = self.url.host_str()?;
        let mut labels = host.split('.');
        match (labels.next(), labels.next(), labels.next()) {
            (Some("sqs"), Some(region), Some("amazonaws")) => Some(region.to_string()),
            (Some(region), Some("queue"), Some("amazonaws")) => Some(region.to_string()),
            _ => None,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.wait_time.is_zero() {
            return Err(ConfigError::invalid("wait-time", "must be positive"));
        }
        if self.wait_time > MAX_WAIT_TIME {
            return Err(ConfigError::invalid(
                "wait-time",
                format!("must be at most {}s", MAX_WAIT_TIME.as_secs()),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::invalid("refresh-interval", "must be positive"));
        }
        if self.refresh_interval >= self.visibility_timeout {
            return Err(ConfigError::invalid(
                "refresh-interval",
                format!(
                    "{}s must be shorter than the visibility timeout of {}s",
                    self.refresh_interval.as_secs(),
                    self.visibility_timeout.as_secs()
                ),
            ));
        }
        if self.region().is_none() {
            return Err(ConfigError::MissingField("queue region".to_string()));
        }
        Ok(())
    }
}

/// Parse server configuration from KDL text, starting from the defaults.
pub fn parse_server_config(kdl: &str) -> ConfigResult<ServerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = ServerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "listen" => {
                let value = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("listen address".to_string()))?;
                config.listen = value
                    .parse()
                    .map_err(|e| ConfigError::invalid("listen", format!("{}: {}", value, e)))?;
            }
            "builds-dir" => {
                let value = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("builds-dir path".to_string()))?;
                config.builds_dir = PathBuf::from(value);
            }
            "tail-output" => {
                config.tail_output = get_first_bool_arg(node)
                    .ok_or_else(|| ConfigError::invalid("tail-output", "expected #true or #false"))?;
            }
            "force-recursive-clone" => {
                config.force_recursive_clone = get_first_bool_arg(node).ok_or_else(|| {
                    ConfigError::invalid("force-recursive-clone", "expected #true or #false")
                })?;
            }
            "callback-timeout" => {
                config.callback_timeout = get_seconds_arg(node, "callback-timeout")?;
            }
            "queue" => {
                config.queue = Some(parse_queue(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueConfig> {
    let raw = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("queue url".to_string()))?;
    let url = parse_url("queue", &raw)?;
    let mut queue = QueueConfig::new(url);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "region" => {
                    queue.region = get_first_string_arg(child);
                }
                "endpoint" => {
                    if let Some(raw) = get_first_string_arg(child) {
                        queue.endpoint = Some(parse_url("endpoint", &raw)?);
                    }
                }
                "wait-time" => {
                    queue.wait_time = get_seconds_arg(child, "wait-time")?;
                }
                "visibility-timeout" => {
                    queue.visibility_timeout = get_seconds_arg(child, "visibility-timeout")?;
                }
                "refresh-interval" => {
                    queue.refresh_interval = get_seconds_arg(child, "refresh-interval")?;
                }
                _ => {}
            }
        }
    }

    Ok(queue)
}

fn parse_url(field: &str, raw: &str) -> ConfigResult<Url> {
    Url::parse(raw).map_err(|e| ConfigError::invalid(field, format!("{}: {}", raw, e)))
}

// Helper functions for extracting values from KDL nodes

fn first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    first_arg(node).and_then(|v| v.as_bool())
}

fn get_seconds_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let value = first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| ConfigError::invalid(field, "expected a number of seconds"))?;
    let secs = u64::try_from(value)
        .map_err(|_| ConfigError::invalid(field, format!("{} is out of range", value)))?;
    Ok(Duration::from_secs(secs))
}
