//! Local subprocess executor.

use async_trait::async_trait;
use builder_core::executor::{CommandSpec, ExecOutcome, Executor, StopMode};
use builder_core::{Error, ProcessState};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::log::open_append;
use crate::transcript;

/// Spawn attempts when the freshly written executable is still busy.
const SPAWN_ATTEMPTS: u32 = 5;

/// How long leftover group members get to disappear after SIGKILL.
const GROUP_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs commands as local child processes.
///
/// Each child gets its own process group so that stopping it also stops
/// everything it spawned. Stdout and stderr both go to the build log.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    /// How long a terminated command may take to exit before it is killed.
    termination_grace: Duration,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            termination_grace: Duration::from_secs(10),
        }
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    fn command(spec: &CommandSpec, log: std::fs::File) -> std::io::Result<Command> {
        let stderr = log.try_clone()?;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }

    /// Spawn, retrying while the executable is reported busy. A script that
    /// was just written can still be open in a concurrently forked child.
    async fn spawn(spec: &CommandSpec, log: &File) -> std::io::Result<Child> {
        let mut attempt = 1;
        loop {
            let handle = log.try_clone().await?.into_std().await;
            let result = Self::command(spec, handle)?.spawn();
            match result {
                Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32)
                    && attempt < SPAWN_ATTEMPTS =>
                {
                    debug!(program = %spec.program, attempt, "Executable busy, retrying spawn");
                    tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Signal the child's whole process group and reap it.
    async fn stop(&self, child: &mut Child, mode: StopMode) -> Option<ProcessState> {
        let pid = child.id();
        let signal = match mode {
            StopMode::Kill => Signal::SIGKILL,
            StopMode::Terminate => Signal::SIGTERM,
        };

        if let Some(pid) = pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
                warn!(pid, error = %e, "Failed to signal process group");
                let _ = child.start_kill();
            }
        }

        let status = match mode {
            StopMode::Kill => child.wait().await,
            StopMode::Terminate => {
                match tokio::time::timeout(self.termination_grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(pid, "Command ignored SIGTERM, killing");
                        if let Some(pid) = pid {
                            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                        }
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            }
        };

        status
            .ok()
            .map(|status| ProcessState::from_exit_status(pid, &status))
    }
}

/// Kill whatever is left in the process group led by `pid` and wait until
/// the group is gone. Background children must not outlive their command:
/// nothing may write to the log after the trailer.
async fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => debug!(pid, "Killed leftover processes in group"),
        Err(Errno::ESRCH) => return,
        Err(e) => {
            warn!(pid, error = %e, "Failed to kill process group");
            return;
        }
    }

    let started = tokio::time::Instant::now();
    while killpg(pgid, None).is_ok() {
        if started.elapsed() >= GROUP_EXIT_TIMEOUT {
            warn!(pid, "Process group still present after SIGKILL");
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Transcript writes are best effort: losing one must not mask the outcome.
async fn write_transcript(log: &mut File, text: &str) {
    if let Err(e) = log.write_all(text.as_bytes()).await {
        warn!(error = %e, "Failed to write transcript");
        return;
    }
    let _ = log.flush().await;
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(
        &self,
        spec: CommandSpec,
        log_path: &Path,
        cancel: &CancellationToken,
    ) -> ExecOutcome {
        if cancel.is_cancelled() {
            return ExecOutcome::failed(Error::Cancelled);
        }

        let mut log = match open_append(log_path).await {
            Ok(log) => log,
            Err(e) => return ExecOutcome::failed(e),
        };

        write_transcript(&mut log, &transcript::header(&spec)).await;

        if cancel.is_cancelled() {
            return ExecOutcome::failed(Error::Cancelled);
        }

        let mut child = match Self::spawn(&spec, &log).await {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("{}: {}", spec.program, e);
                write_transcript(&mut log, &transcript::failure_trailer(&reason)).await;
                return ExecOutcome::failed(Error::CommandFailed(reason));
            }
        };

        let pid = child.id();
        info!(program = %spec.program, pid, dir = %spec.working_dir.display(), "Command started");

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    kill_group(pid).await;
                    let state = ProcessState::from_exit_status(pid, &status);
                    let result = if status.success() {
                        write_transcript(&mut log, transcript::success_trailer()).await;
                        Ok(())
                    } else {
                        write_transcript(&mut log, &transcript::failure_trailer(&state.to_string())).await;
                        Err(Error::CommandFailed(state.to_string()))
                    };
                    info!(program = %spec.program, pid, status = %state, "Command exited");
                    ExecOutcome {
                        process_state: Some(state),
                        result,
                    }
                }
                Err(e) => {
                    kill_group(pid).await;
                    ExecOutcome::failed(Error::Io(format!("waiting for {}: {}", spec.program, e)))
                }
            },
            _ = cancel.cancelled() => {
                info!(program = %spec.program, pid, mode = ?spec.stop_mode, "Cancellation requested, stopping command");
                let state = self.stop(&mut child, spec.stop_mode).await;
                kill_group(pid).await;
                write_transcript(
                    &mut log,
                    &transcript::cancelled_trailer(spec.stop_mode, state.as_ref()),
                )
                .await;
                ExecOutcome {
                    process_state: state,
                    result: Err(Error::Cancelled),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_core::ErrorKind;
    use std::collections::BTreeMap;

    fn sh(dir: &Path, script: &str) -> CommandSpec {
        let mut env = BTreeMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
        CommandSpec::new("sh", dir).args(["-c", script]).envs(env)
    }

    #[tokio::test]
    async fn test_success_appends_output_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.log");

        let outcome = LocalExecutor::new()
            .run(sh(dir.path(), "echo out; echo err >&2"), &log, &CancellationToken::new())
            .await;

        assert!(outcome.result.is_ok());
        let state = outcome.process_state.unwrap();
        assert!(state.success);
        assert_eq!(state.exit_code, Some(0));

        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.starts_with(&format!("cd {}\n", dir.path().display())));
        assert!(text.contains("exec sh -c "));
        let out = text.find("out\n").unwrap();
        let err = text.find("err\n").unwrap();
        assert!(out < err);
        assert!(text.ends_with("\nSuccess\n\n"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.log");

        let outcome = LocalExecutor::new()
            .run(sh(dir.path(), "exit 3"), &log, &CancellationToken::new())
            .await;

        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::CommandFailed);
        assert_eq!(outcome.process_state.unwrap().exit_code, Some(3));
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.ends_with("\nFailed: exit status: 3\n\n"));
    }

    #[tokio::test]
    async fn test_already_cancelled_does_no_io() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.log");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = LocalExecutor::new()
            .run(sh(dir.path(), "echo never"), &log, &cancel)
            .await;

        assert!(outcome.is_cancelled());
        assert!(outcome.process_state.is_none());
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn test_cancel_terminates_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.log");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let spec = sh(dir.path(), "echo started; sleep 30").stop_mode(StopMode::Terminate);
        let started = std::time::Instant::now();
        let outcome = LocalExecutor::new().run(spec, &log, &cancel).await;

        assert!(outcome.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
        let state = outcome.process_state.unwrap();
        assert!(!state.success);
        assert_eq!(state.signal, Some(Signal::SIGTERM as i32));

        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("started\n"));
        assert!(text.contains("Cancelled, command terminated"));
    }

    #[tokio::test]
    async fn test_sigterm_is_escalated_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.log");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let spec = sh(dir.path(), "trap '' TERM; sleep 30").stop_mode(StopMode::Terminate);
        let outcome = LocalExecutor::new()
            .with_termination_grace(Duration::from_millis(200))
            .run(spec, &log, &cancel)
            .await;

        assert!(outcome.is_cancelled());
        assert_eq!(
            outcome.process_state.unwrap().signal,
            Some(Signal::SIGKILL as i32)
        );
    }

    #[tokio::test]
    async fn test_background_children_do_not_outlive_command() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.log");

        let outcome = LocalExecutor::new()
            .run(
                sh(dir.path(), "(sleep 1; echo late-$((1+1))) & echo main"),
                &log,
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.result.is_ok());

        let at_return = std::fs::read_to_string(&log).unwrap();
        assert!(at_return.contains("main\n"));
        assert!(at_return.ends_with("\nSuccess\n\n"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let later = std::fs::read_to_string(&log).unwrap();
        assert_eq!(later, at_return);
        assert!(!later.contains("late-2"));
    }

    #[tokio::test]
    async fn test_cancel_stops_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.log");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        // The background child ignores SIGTERM; only the group kill stops it.
        let spec = sh(
            dir.path(),
            "(trap '' TERM; sleep 1; echo late-$((1+1))) & wait",
        )
        .stop_mode(StopMode::Terminate);
        let outcome = LocalExecutor::new().run(spec, &log, &cancel).await;
        assert!(outcome.is_cancelled());

        let at_return = std::fs::read_to_string(&log).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let later = std::fs::read_to_string(&log).unwrap();
        assert_eq!(later, at_return);
        assert!(!later.contains("late-2"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_without_process_state() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.log");

        let spec = CommandSpec::new("/nonexistent/definitely-not-here", dir.path());
        let outcome = LocalExecutor::new()
            .run(spec, &log, &CancellationToken::new())
            .await;

        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::CommandFailed);
        assert!(outcome.process_state.is_none());
        assert!(std::fs::read_to_string(&log).unwrap().contains("Failed: "));
    }
}
