//! Per-build log file.
//!
//! The log is append-only. Executors write transcript lines and redirect the
//! child's stdout/stderr into it; the build reads it back in full once every
//! process has stopped. A follower can tail it while the build runs.

use builder_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Append-only log file of one build.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    /// Create the (empty) log file with owner-only permissions.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let sink = Self { path: path.into() };
        sink.open_append().await?;
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the log for appending, creating it if needed.
    pub async fn open_append(&self) -> Result<File> {
        open_append(&self.path).await
    }

    /// Append `text` to the log.
    pub async fn append(&self, text: &str) -> Result<()> {
        let mut file = self.open_append().await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read the whole log. Invalid UTF-8 is replaced rather than rejected.
    pub async fn read_all(&self) -> Result<String> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Tail the log, calling `on_line` for every complete line, until `stop`
    /// fires. Whatever is left in the file after `stop` is drained first.
    pub fn follow<F>(&self, stop: CancellationToken, mut on_line: F) -> JoinHandle<()>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut offset = 0u64;
            let mut pending = String::new();
            loop {
                let stopping = stop.is_cancelled();
                match read_from(&path, offset).await {
                    Ok(chunk) => {
                        offset += chunk.len() as u64;
                        pending.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            on_line(line.trim_end_matches('\n'));
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to follow build log");
                        return;
                    }
                }

                if stopping {
                    if !pending.is_empty() {
                        on_line(&pending);
                    }
                    return;
                }

                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => {}
                }
            }
        })
    }
}

pub(crate) async fn open_append(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
        .open(path)
        .await
        .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_create_append_read() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::create(dir.path().join("output.log")).await.unwrap();
        assert_eq!(sink.read_all().await.unwrap(), "");

        sink.append("first\n").await.unwrap();
        sink.append("second\n").await.unwrap();
        assert_eq!(sink.read_all().await.unwrap(), "first\nsecond\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_log_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::create(dir.path().join("output.log")).await.unwrap();
        let mode = std::fs::metadata(sink.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_follow_sees_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::create(dir.path().join("output.log")).await.unwrap();

        let lines = Arc::new(Mutex::new(Vec::new()));
        let seen = lines.clone();
        let stop = CancellationToken::new();
        let handle = sink.follow(stop.clone(), move |line| {
            seen.lock().unwrap().push(line.to_string());
        });

        sink.append("one\ntwo\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        sink.append("three\npartial").await.unwrap();
        stop.cancel();
        handle.await.unwrap();

        assert_eq!(
            *lines.lock().unwrap(),
            vec!["one", "two", "three", "partial"]
        );
    }
}
