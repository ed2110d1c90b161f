//! Build orchestrator - clones the repository, then runs the script.

use builder_core::{
    BuildDescriptor, BuildSnapshot, BuildStatus, BuildToken, Error, ProcessState, Result,
};
use builder_executor::{BuildLayout, Executor, GitCloner, LogSink, ScriptRunner};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A single build.
///
/// The task started by [`BuildRunner::start`] is the only writer of the
/// build's state. Everyone else reads snapshots or waits on [`Build::done`],
/// which resolves once the state turns terminal. The terminal state is
/// published in one step together with the output, so it is observed
/// exactly once and never half-written.
pub struct Build {
    token: BuildToken,
    descriptor: BuildDescriptor,
    layout: BuildLayout,
    cancel: CancellationToken,
    state: watch::Sender<BuildSnapshot>,
}

impl Build {
    pub fn token(&self) -> &BuildToken {
        &self.token
    }

    pub fn descriptor(&self) -> &BuildDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    /// Path of the append-only log, readable while the build runs.
    pub fn log_path(&self) -> &Path {
        &self.layout.log
    }

    /// Current state.
    pub fn snapshot(&self) -> BuildSnapshot {
        self.state.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().is_done()
    }

    /// Wait for completion and return the final state.
    pub async fn done(&self) -> BuildSnapshot {
        let mut rx = self.state.subscribe();
        match rx.wait_for(BuildSnapshot::is_done).await {
            Ok(snapshot) => snapshot.clone(),
            // The sender lives in `self`, so it cannot be gone.
            Err(_) => self.snapshot(),
        }
    }

    /// Request cancellation. Running commands are stopped and the build
    /// fails with [`Error::Cancelled`]; a finished build is unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_status(&self, status: BuildStatus) {
        self.state.send_modify(|s| {
            debug_assert!(s.status.can_transition_to(status));
            s.status = status;
        });
    }
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("token", &self.token)
            .field("git_url", &self.descriptor.git_url)
            .field("root", &self.layout.root)
            .field("status", &self.state.borrow().status)
            .finish()
    }
}

/// Starts builds: owns the clone and script steps shared by all of them.
#[derive(Debug, Clone)]
pub struct BuildRunner {
    cloner: GitCloner,
    script_runner: ScriptRunner,
    tail_output: bool,
}

impl BuildRunner {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            cloner: GitCloner::new(executor.clone()),
            script_runner: ScriptRunner::new(executor),
            tail_output: false,
        }
    }

    /// Give every clone `--recursive`, whatever the descriptor says.
    pub fn force_recursive_clone(mut self, force: bool) -> Self {
        self.cloner = self.cloner.force_recursive(force);
        self
    }

    /// Mirror each build's log into `tracing` while it runs.
    pub fn tail_output(mut self, tail: bool) -> Self {
        self.tail_output = tail;
        self
    }

    /// Start a build in `root`, which must already exist and belong to this
    /// build alone. Returns once the log exists; the build itself runs in
    /// the background under a child of `parent`.
    pub async fn start(
        &self,
        token: BuildToken,
        descriptor: BuildDescriptor,
        root: PathBuf,
        parent: &CancellationToken,
    ) -> Result<Arc<Build>> {
        let checkout_dir = descriptor.checkout_dir()?;
        let layout = BuildLayout::new(root, &checkout_dir);
        let sink = LogSink::create(&layout.log).await?;

        let initial = BuildSnapshot {
            token: Some(token.clone()),
            status: BuildStatus::Init,
            git_url: descriptor.git_url.clone(),
            git_checkout_dir: checkout_dir,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let (state, _) = watch::channel(initial);

        let build = Arc::new(Build {
            token,
            descriptor,
            layout,
            cancel: parent.child_token(),
            state,
        });

        info!(
            token = %build.token,
            git_url = %build.descriptor.git_url,
            root = %build.layout.root.display(),
            "Starting build"
        );
        debug!(token = %build.token, script = %build.descriptor.build_script, "Build script");

        let runner = self.clone();
        let task_build = build.clone();
        tokio::spawn(async move { runner.execute(task_build, sink).await });

        Ok(build)
    }

    async fn execute(self, build: Arc<Build>, sink: LogSink) {
        let follower = self.tail_output.then(|| {
            let stop = CancellationToken::new();
            let token = build.token.clone();
            let handle = sink.follow(stop.clone(), move |line| {
                info!(target: "build_output", token = %token, "{}", line);
            });
            (stop, handle)
        });

        let mut errors = Vec::new();
        let mut process_state: Option<ProcessState> = None;

        build.set_status(BuildStatus::Cloning);
        let cloned = self
            .cloner
            .clone_repo(&build.descriptor, &build.layout, &build.cancel)
            .await;
        process_state = cloned.process_state.or(process_state);

        match cloned.result {
            Err(e) => {
                warn!(token = %build.token, error = %e, "Clone failed, skipping build script");
                errors.push(e);
            }
            Ok(()) => {
                build.set_status(BuildStatus::Running);
                let ran = self
                    .script_runner
                    .run_script(&build.descriptor, &build.layout, &build.cancel)
                    .await;
                process_state = ran.process_state.or(process_state);
                if let Err(e) = ran.result {
                    warn!(token = %build.token, error = %e, "Build script failed");
                    errors.push(e);
                }
            }
        }

        if let Some((stop, handle)) = follower {
            stop.cancel();
            let _ = handle.await;
        }

        // Every process has stopped, so the log is complete.
        let output = match sink.read_all().await {
            Ok(output) => output,
            Err(e) => {
                warn!(token = %build.token, error = %e, "Failed to read build log");
                errors.push(e);
                String::new()
            }
        };

        let status = if errors.is_empty() {
            BuildStatus::Success
        } else {
            BuildStatus::Failure
        };

        build.state.send_modify(|s| {
            s.status = status;
            s.errors = errors;
            s.output = output;
            s.process_state = process_state;
            s.finished_at = Some(Utc::now());
        });

        info!(token = %build.token, %status, "Build finished");
    }
}

/// Whether the errors of a finished build include a cancellation.
pub fn was_cancelled(snapshot: &BuildSnapshot) -> bool {
    snapshot.errors.iter().any(Error::is_cancelled)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use builder_core::ErrorKind;
    use builder_executor::{CommandSpec, ExecOutcome};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    /// Scripted executor: answers each command in turn, after writing a line
    /// to the log and waiting `delay` (or until cancelled).
    pub(crate) struct Scripted {
        pub results: Mutex<Vec<builder_core::Result<()>>>,
        pub programs: Mutex<Vec<String>>,
        pub delay: Duration,
    }

    impl Scripted {
        pub(crate) fn new(results: Vec<builder_core::Result<()>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                programs: Mutex::new(Vec::new()),
                delay,
            })
        }

        pub(crate) fn ok(delay: Duration) -> Arc<Self> {
            Self::new(vec![Ok(()), Ok(())], delay)
        }
    }

    #[async_trait]
    impl Executor for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, spec: CommandSpec, log: &Path, cancel: &CancellationToken) -> ExecOutcome {
            if cancel.is_cancelled() {
                return ExecOutcome::failed(Error::Cancelled);
            }
            let name = spec.program.rsplit('/').next().unwrap_or_default().to_string();
            self.programs.lock().unwrap().push(name.clone());
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(log)
                .await
                .unwrap();
            file.write_all(format!("ran {}\n", name).as_bytes()).await.unwrap();
            drop(file);

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return ExecOutcome::failed(Error::Cancelled),
            }

            let mut results = self.results.lock().unwrap();
            let result = if results.is_empty() { Ok(()) } else { results.remove(0) };
            let state = ProcessState {
                pid: Some(1),
                exit_code: Some(if result.is_ok() { 0 } else { 1 }),
                signal: None,
                success: result.is_ok(),
            };
            ExecOutcome {
                process_state: Some(state),
                result,
            }
        }
    }

    async fn start(
        executor: Arc<Scripted>,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Arc<Build> {
        BuildRunner::new(executor)
            .start(
                BuildToken::generate(),
                BuildDescriptor::new("https://example.com/org/myrepo.git", "#!/bin/sh\necho hi\n"),
                root.to_path_buf(),
                cancel,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_build() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::ok(Duration::ZERO);
        let build = start(executor.clone(), dir.path(), &CancellationToken::new()).await;

        let snapshot = build.done().await;
        assert_eq!(snapshot.status, BuildStatus::Success);
        assert!(snapshot.errors.is_empty());
        assert_eq!(snapshot.git_checkout_dir, "myrepo");
        assert_eq!(snapshot.output, "ran git\nran build\n");
        assert!(snapshot.process_state.unwrap().success);
        assert!(snapshot.finished_at.is_some());
        assert_eq!(*executor.programs.lock().unwrap(), vec!["git", "build"]);
    }

    #[tokio::test]
    async fn test_clone_failure_skips_script() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(
            vec![Err(Error::CommandFailed("exit status: 128".into()))],
            Duration::ZERO,
        );
        let build = start(executor.clone(), dir.path(), &CancellationToken::new()).await;

        let snapshot = build.done().await;
        assert_eq!(snapshot.status, BuildStatus::Failure);
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.errors[0].kind(), ErrorKind::CloneFailed);
        assert_eq!(snapshot.process_state.unwrap().exit_code, Some(1));
        assert_eq!(*executor.programs.lock().unwrap(), vec!["git"]);
        assert!(!build.layout().script.exists());
    }

    #[tokio::test]
    async fn test_script_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(
            vec![Ok(()), Err(Error::CommandFailed("exit status: 1".into()))],
            Duration::ZERO,
        );
        let build = start(executor, dir.path(), &CancellationToken::new()).await;

        let snapshot = build.done().await;
        assert_eq!(snapshot.status, BuildStatus::Failure);
        assert_eq!(snapshot.errors, vec![Error::ScriptFailed("exit status: 1".into())]);
        assert!(snapshot.output.contains("ran build"));
    }

    #[tokio::test]
    async fn test_cancel_mid_build_completes_once() {
        let dir = tempfile::tempdir().unwrap();
        let build = start(
            Scripted::ok(Duration::from_secs(30)),
            dir.path(),
            &CancellationToken::new(),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        build.cancel();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), build.done())
            .await
            .unwrap();
        assert_eq!(snapshot.status, BuildStatus::Failure);
        assert!(was_cancelled(&snapshot));
        assert_eq!(snapshot.output, "ran git\n");
        assert!(build.is_done());

        // Already finished: a second cancel changes nothing.
        build.cancel();
        assert_eq!(build.done().await.errors, snapshot.errors);
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_build() {
        let dir = tempfile::tempdir().unwrap();
        let parent = CancellationToken::new();
        parent.cancel();
        let build = start(Scripted::ok(Duration::ZERO), dir.path(), &parent).await;

        let snapshot = build.done().await;
        assert_eq!(snapshot.errors, vec![Error::Cancelled]);
        assert!(snapshot.process_state.is_none());
        assert_eq!(snapshot.output, "");
    }

    #[tokio::test]
    async fn test_done_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let build = start(
            Scripted::ok(Duration::from_millis(50)),
            dir.path(),
            &CancellationToken::new(),
        )
        .await;

        let early = build.done();
        let (first, second) = tokio::join!(early, build.done());
        let late = build.done().await;
        assert_eq!(first.output, second.output);
        assert_eq!(first.output, late.output);
        assert_eq!(first.status, late.status);
    }

    #[tokio::test]
    async fn test_invalid_checkout_dir_rejected_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = BuildDescriptor::new("https://example.com/r.git", "");
        descriptor.git_checkout_dir = Some("../escape".into());

        let err = BuildRunner::new(Scripted::ok(Duration::ZERO))
            .start(
                BuildToken::generate(),
                descriptor,
                dir.path().to_path_buf(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
