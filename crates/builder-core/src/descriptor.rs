//! Build descriptors.
//!
//! A descriptor is the user-supplied specification of what to clone and run.
//! It is immutable once a build starts.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

use crate::{Error, Result};

/// What to clone and which script to run against the checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDescriptor {
    /// Script text, written to an executable file and run from the checkout.
    #[serde(default)]
    pub build_script: String,
    /// Repository to clone.
    pub git_url: String,
    /// Private key used for SSH clones.
    #[serde(default)]
    pub git_secret_key: Option<String>,
    /// Branch to check out (defaults to the remote HEAD).
    #[serde(default)]
    pub git_branch: Option<String>,
    /// Clone the whole history instead of `--depth 1`.
    #[serde(default)]
    pub git_full_clone: bool,
    /// Clone submodules recursively.
    #[serde(default)]
    pub git_recursive: bool,
    /// Checkout directory name (derived from `git_url` when unset).
    #[serde(default)]
    pub git_checkout_dir: Option<String>,
}

impl BuildDescriptor {
    pub fn new(git_url: impl Into<String>, build_script: impl Into<String>) -> Self {
        Self {
            git_url: git_url.into(),
            build_script: build_script.into(),
            ..Default::default()
        }
    }

    /// The secret key, if one was supplied and is non-empty.
    pub fn secret_key(&self) -> Option<&str> {
        self.git_secret_key.as_deref().filter(|k| !k.is_empty())
    }

    /// The branch, if one was supplied and is non-empty.
    pub fn branch(&self) -> Option<&str> {
        self.git_branch.as_deref().filter(|b| !b.is_empty())
    }

    /// Name of the checkout directory: the explicit override, or the last
    /// path segment of the git URL with any `.git` suffix stripped.
    pub fn checkout_dir(&self) -> Result<String> {
        let dir = match self.git_checkout_dir.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => dir.to_string(),
            None => derive_checkout_dir(&self.git_url),
        };

        let path = Path::new(&dir);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if dir.is_empty() || escapes {
            return Err(Error::InvalidInput(format!(
                "invalid checkout directory {:?}",
                dir
            )));
        }

        Ok(dir)
    }

    /// Check the descriptor before a build is created for it.
    pub fn validate(&self) -> Result<()> {
        if self.git_url.trim().is_empty() {
            return Err(Error::InvalidInput("git_url is required".to_string()));
        }
        self.checkout_dir()?;
        Ok(())
    }
}

/// Last segment of a git URL (`/` or scp-style `:` separated), minus `.git`.
pub fn derive_checkout_dir(git_url: &str) -> String {
    let trimmed = git_url.trim().trim_end_matches('/');
    let base = trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    base.strip_suffix(".git").unwrap_or(base).to_string()
}

/// A descriptor together with the URLs notified on completion.
///
/// This is the body of `POST /builds`, of queue messages and of job files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(flatten)]
    pub descriptor: BuildDescriptor,
    #[serde(default)]
    pub callbacks: Vec<String>,
}

impl BuildRequest {
    /// Decode a request from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let request: BuildRequest = serde_json::from_slice(data)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        self.descriptor.validate()?;
        for cb in &self.callbacks {
            let parsed = url::Url::parse(cb)
                .map_err(|e| Error::InvalidInput(format!("callback {:?}: {}", cb, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::InvalidInput(format!(
                    "callback {:?}: unsupported scheme",
                    cb
                )));
            }
        }
        Ok(())
    }
}
