//! Executor trait and command types.
//!
//! Executors run one external command under a cancellation signal, appending
//! a transcript and the command's combined stdout/stderr to a log file.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::{Error, ProcessState, Result};

/// How a running command is stopped when its build is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGKILL. Used for clones, whose partial state is garbage anyway.
    Kill,
    /// SIGTERM, so a build script gets a chance to flush its state.
    Terminate,
}

/// Specification of one command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute, looked up on the child's `PATH` when relative.
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the child.
    pub working_dir: PathBuf,
    /// Complete child environment; nothing else is inherited from the host.
    pub env: BTreeMap<String, String>,
    pub stop_mode: StopMode,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            stop_mode: StopMode::Kill,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn stop_mode(mut self, mode: StopMode) -> Self {
        self.stop_mode = mode;
        self
    }

    /// `program` followed by `args`.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

/// What happened to a command.
///
/// `process_state` is present whenever a process was started and reaped,
/// including after it was killed on cancellation.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub process_state: Option<ProcessState>,
    pub result: Result<()>,
}

impl ExecOutcome {
    pub fn failed(error: Error) -> Self {
        Self {
            process_state: None,
            result: Err(error),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.result, Err(Error::Cancelled))
    }
}

/// Trait for command executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run a command to completion or cancellation.
    ///
    /// Fails with [`Error::Cancelled`] without doing any I/O when `cancel`
    /// has already fired.
    async fn run(
        &self,
        spec: CommandSpec,
        log_path: &Path,
        cancel: &CancellationToken,
    ) -> ExecOutcome;
}
