//! Build status, process exit state and the build snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildToken, Error};

/// Lifecycle of a build.
///
/// `init -> cloning -> running -> success`, with `failure` reachable from
/// `cloning` and `running`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Init,
    Cloning,
    Running,
    Success,
    Failure,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failure)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Init, Cloning)
                | (Init, Failure)
                | (Cloning, Running)
                | (Cloning, Failure)
                | (Running, Success)
                | (Running, Failure)
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::Init => "init",
            BuildStatus::Cloning => "cloning",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Exit information of a subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: Option<u32>,
    /// Exit code, absent when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal number, if any.
    pub signal: Option<i32>,
    pub success: bool,
}

impl ProcessState {
    pub fn from_exit_status(pid: Option<u32>, status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            pid,
            exit_code: status.code(),
            signal,
            success: status.success(),
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "exit status: {}", code),
            (None, Some(sig)) => write!(f, "signal: {}", sig),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Point-in-time view of a build, as served over HTTP and posted to callbacks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<BuildToken>,
    pub status: BuildStatus,
    pub git_url: String,
    pub git_checkout_dir: String,
    pub errors: Vec<Error>,
    /// Full log text, populated once the build has stopped.
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_state: Option<ProcessState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildSnapshot {
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.status == BuildStatus::Success && self.errors.is_empty()
    }
}
