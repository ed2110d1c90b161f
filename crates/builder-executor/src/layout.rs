//! Filesystem layout of a build's scratch directory.

use std::path::{Path, PathBuf};

/// Name of the SSH key file inside [`BuildLayout::ssh_dir`].
pub const SSH_KEY_FILE: &str = "id";

/// Paths inside one build's exclusively owned scratch directory.
///
/// ```text
/// <root>/.ssh/id                  private key (0600), only when supplied
/// <root>/build                    build script (0700)
/// <root>/output.log               append-only build log (0600)
/// <root>/workspace/<checkout>     git checkout, cwd of the script
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    pub root: PathBuf,
    pub ssh_dir: PathBuf,
    pub ssh_key_file: String,
    pub script: PathBuf,
    pub log: PathBuf,
    pub workspace: PathBuf,
    pub checkout: PathBuf,
}

impl BuildLayout {
    pub fn new(root: impl Into<PathBuf>, checkout_dir: &str) -> Self {
        let root = root.into();
        let workspace = root.join("workspace");
        Self {
            ssh_dir: root.join(".ssh"),
            ssh_key_file: SSH_KEY_FILE.to_string(),
            script: root.join("build"),
            log: root.join("output.log"),
            checkout: workspace.join(checkout_dir),
            workspace,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ssh_key(&self) -> PathBuf {
        self.ssh_dir.join(&self.ssh_key_file)
    }
}

/// Write `contents` to `path`, creating the file with `mode` so it is never
/// visible with wider permissions. The mode is applied again afterwards
/// because the umask may have cleared bits of it.
pub async fn write_private(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.flush().await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_write_private_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id");

        write_private(&path, b"secret\n", 0o600).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_write_private_narrows_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build");
        std::fs::write(&path, "old contents that are longer").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).unwrap();

        write_private(&path, b"new", 0o700).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_layout_paths() {
        let layout = BuildLayout::new("/b/simple-builder-x", "myrepo");
        assert_eq!(layout.ssh_key(), PathBuf::from("/b/simple-builder-x/.ssh/id"));
        assert_eq!(layout.script, PathBuf::from("/b/simple-builder-x/build"));
        assert_eq!(layout.log, PathBuf::from("/b/simple-builder-x/output.log"));
        assert_eq!(
            layout.checkout,
            PathBuf::from("/b/simple-builder-x/workspace/myrepo")
        );
    }
}
