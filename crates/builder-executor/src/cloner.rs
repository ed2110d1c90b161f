//! Git clone step.

use builder_core::executor::{CommandSpec, ExecOutcome, Executor, StopMode};
use builder_core::{BuildDescriptor, Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::env::restricted_env;
use crate::layout::{BuildLayout, write_private};

/// SSH invocation used for every clone. Host keys are not verified: build
/// hosts have no known_hosts of their own.
const SSH_BASE_COMMAND: &str =
    "ssh -v -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null";

/// Clones the repository a build describes into its checkout directory.
#[derive(Clone)]
pub struct GitCloner {
    executor: Arc<dyn Executor>,
    git: String,
    force_recursive: bool,
}

impl GitCloner {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            git: "git".to_string(),
            force_recursive: false,
        }
    }

    /// Clone submodules regardless of what the descriptor asks for.
    pub fn force_recursive(mut self, force: bool) -> Self {
        self.force_recursive = force;
        self
    }

    /// Use a different git binary.
    pub fn git_program(mut self, program: impl Into<String>) -> Self {
        self.git = program.into();
        self
    }

    /// Arguments of the `git` invocation, without the program name.
    pub fn clone_args(&self, desc: &BuildDescriptor, checkout: &Path) -> Vec<String> {
        let mut args = vec!["clone".to_string()];
        if !desc.git_full_clone {
            args.push("--depth".to_string());
            args.push("1".to_string());
        }
        if desc.git_recursive || self.force_recursive {
            args.push("--recursive".to_string());
        }
        if let Some(branch) = desc.branch() {
            args.push("-b".to_string());
            args.push(branch.to_string());
        }
        args.push(desc.git_url.clone());
        args.push(checkout.to_string_lossy().to_string());
        args
    }

    /// Value of `GIT_SSH_COMMAND` for a clone using `key`, if any.
    pub fn ssh_command(key: Option<&Path>) -> String {
        match key {
            Some(key) => format!("{} -i {}", SSH_BASE_COMMAND, key.display()),
            None => SSH_BASE_COMMAND.to_string(),
        }
    }

    /// Clone `desc` into `layout.checkout`, logging into `layout.log`.
    ///
    /// Failures other than cancellation and local I/O are reported as
    /// [`Error::CloneFailed`].
    pub async fn clone_repo(
        &self,
        desc: &BuildDescriptor,
        layout: &BuildLayout,
        cancel: &CancellationToken,
    ) -> ExecOutcome {
        if cancel.is_cancelled() {
            return ExecOutcome::failed(Error::Cancelled);
        }

        let key = match write_secret_key(desc, layout).await {
            Ok(key) => key,
            Err(e) => return ExecOutcome::failed(e),
        };

        if let Err(e) = tokio::fs::create_dir_all(&layout.workspace).await {
            return ExecOutcome::failed(Error::Io(format!(
                "{}: {}",
                layout.workspace.display(),
                e
            )));
        }

        let spec = CommandSpec::new(&self.git, layout.root())
            .args(self.clone_args(desc, &layout.checkout))
            .envs(restricted_env(layout.root()))
            .env("GIT_SSH_COMMAND", Self::ssh_command(key.as_deref()))
            .stop_mode(StopMode::Kill);

        info!(
            executor = self.executor.name(),
            url = %desc.git_url,
            checkout = %layout.checkout.display(),
            "Cloning repository"
        );

        let outcome = self.executor.run(spec, &layout.log, cancel).await;
        ExecOutcome {
            process_state: outcome.process_state,
            result: outcome.result.map_err(Error::into_clone_failure),
        }
    }
}

impl std::fmt::Debug for GitCloner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCloner")
            .field("executor", &self.executor.name())
            .field("git", &self.git)
            .field("force_recursive", &self.force_recursive)
            .finish()
    }
}

/// Write the descriptor's private key, returning its absolute path. Nothing
/// is written when no key was supplied.
async fn write_secret_key(
    desc: &BuildDescriptor,
    layout: &BuildLayout,
) -> Result<Option<std::path::PathBuf>> {
    let Some(secret) = desc.secret_key() else {
        return Ok(None);
    };
    if layout.ssh_key_file.is_empty() {
        return Err(Error::Misconfigured("ssh key file name is empty".into()));
    }

    let io_err = |path: &Path, e: std::io::Error| Error::Io(format!("{}: {}", path.display(), e));

    let mut dir = tokio::fs::DirBuilder::new();
    dir.recursive(true);
    #[cfg(unix)]
    dir.mode(0o700);
    dir.create(&layout.ssh_dir)
        .await
        .map_err(|e| io_err(&layout.ssh_dir, e))?;

    let key = layout.ssh_key();
    let mut contents = secret.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    write_private(&key, contents.as_bytes(), 0o600)
        .await
        .map_err(|e| io_err(&key, e))?;

    debug!(path = %key.display(), "Wrote ssh key");
    Ok(Some(key))
}
