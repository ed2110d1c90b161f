//! Build script step.

use builder_core::executor::{CommandSpec, ExecOutcome, Executor, StopMode};
use builder_core::{BuildDescriptor, Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::env::restricted_env;
use crate::layout::{BuildLayout, write_private};

/// Writes the build script into the scratch directory and runs it from the
/// checkout.
#[derive(Clone)]
pub struct ScriptRunner {
    executor: Arc<dyn Executor>,
}

impl ScriptRunner {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Run `desc.build_script`. The script file is written even when the
    /// script is empty, so a write failure surfaces before anything runs.
    ///
    /// Failures other than cancellation and local I/O are reported as
    /// [`Error::ScriptFailed`].
    pub async fn run_script(
        &self,
        desc: &BuildDescriptor,
        layout: &BuildLayout,
        cancel: &CancellationToken,
    ) -> ExecOutcome {
        if cancel.is_cancelled() {
            return ExecOutcome::failed(Error::Cancelled);
        }

        if let Err(e) = write_script(&layout.script, &desc.build_script).await {
            return ExecOutcome::failed(e);
        }

        let spec = CommandSpec::new(layout.script.to_string_lossy(), &layout.checkout)
            .envs(restricted_env(layout.root()))
            .stop_mode(StopMode::Terminate);

        info!(
            executor = self.executor.name(),
            script = %layout.script.display(),
            cwd = %layout.checkout.display(),
            "Running build script"
        );

        let outcome = self.executor.run(spec, &layout.log, cancel).await;
        ExecOutcome {
            process_state: outcome.process_state,
            result: outcome.result.map_err(Error::into_script_failure),
        }
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("executor", &self.executor.name())
            .finish()
    }
}

async fn write_script(path: &Path, script: &str) -> Result<()> {
    let io_err = |e: std::io::Error| Error::Io(format!("{}: {}", path.display(), e));

    write_private(path, script.as_bytes(), 0o700)
        .await
        .map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalExecutor;
    use builder_core::ErrorKind;

    async fn prepared(root: &Path) -> BuildLayout {
        let layout = BuildLayout::new(root, "repo");
        tokio::fs::create_dir_all(&layout.checkout).await.unwrap();
        layout
    }

    fn runner() -> ScriptRunner {
        ScriptRunner::new(Arc::new(LocalExecutor::new()))
    }

    #[tokio::test]
    async fn test_script_runs_in_checkout_with_restricted_env() {
        let dir = tempfile::tempdir().unwrap();
        let layout = prepared(dir.path()).await;
        let desc = BuildDescriptor::new(
            "https://h/repo.git",
            "#!/bin/sh\npwd\necho \"home=$HOME\"\necho \"secret=${AWS_SECRET_ACCESS_KEY:-unset}\"\n",
        );

        let outcome = runner()
            .run_script(&desc, &layout, &CancellationToken::new())
            .await;
        assert!(outcome.result.is_ok(), "{:?}", outcome.result);

        let log = std::fs::read_to_string(&layout.log).unwrap();
        let checkout = std::fs::canonicalize(&layout.checkout).unwrap();
        assert!(log.contains(&format!("{}\n", checkout.display())));
        assert!(log.contains(&format!("home={}\n", dir.path().display())));
        assert!(log.contains("secret=unset\n"));
        assert!(log.ends_with("\nSuccess\n\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_file_is_owner_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let layout = prepared(dir.path()).await;
        let desc = BuildDescriptor::new("https://h/repo.git", "#!/bin/sh\ntrue\n");
        runner()
            .run_script(&desc, &layout, &CancellationToken::new())
            .await;

        let mode = std::fs::metadata(&layout.script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_failing_script_is_script_failure() {
        let dir = tempfile::tempdir().unwrap();
        let layout = prepared(dir.path()).await;
        let desc = BuildDescriptor::new("https://h/repo.git", "#!/bin/sh\necho boom\nexit 1\n");

        let outcome = runner()
            .run_script(&desc, &layout, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome.result.unwrap_err(),
            Error::ScriptFailed("exit status: 1".into())
        );
        assert_eq!(outcome.process_state.unwrap().exit_code, Some(1));
        let log = std::fs::read_to_string(&layout.log).unwrap();
        assert!(log.contains("boom\n"));
    }

    #[tokio::test]
    async fn test_empty_script_is_still_written() {
        let dir = tempfile::tempdir().unwrap();
        let layout = prepared(dir.path()).await;
        let desc = BuildDescriptor::new("https://h/repo.git", "");

        runner()
            .run_script(&desc, &layout, &CancellationToken::new())
            .await;
        assert_eq!(std::fs::read_to_string(&layout.script).unwrap(), "");
        assert!(layout.log.exists());
    }

    #[tokio::test]
    async fn test_unwritable_script_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut layout = prepared(dir.path()).await;
        layout.script = dir.path().join("missing").join("build");
        let desc = BuildDescriptor::new("https://h/repo.git", "#!/bin/sh\ntrue\n");

        let outcome = runner()
            .run_script(&desc, &layout, &CancellationToken::new())
            .await;
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Io);
        assert!(!layout.log.exists());
    }
}
