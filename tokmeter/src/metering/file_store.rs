//! Log store backed by JSON-lines files.
//!
//! Layout: `{root}/{log_group}/{developer}/{YYYY}/{MM}/{DD}.jsonl`, one line per entry.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{LogEntry, LogStore, StreamKey, TelemetryError};

#[derive(Debug, Clone)]
pub struct FileLogStore {
    group_dir: PathBuf,
}

impl FileLogStore {
    pub fn new(root: impl AsRef<Path>, log_group: &str) -> Self {
        Self {
            group_dir: root.as_ref().join(log_group),
        }
    }

    /// File backing `stream`
    pub fn stream_path(&self, stream: &StreamKey) -> PathBuf {
        self.group_dir.join(format!("{stream}.jsonl"))
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn ensure_stream(&self, stream: &StreamKey) -> Result<(), TelemetryError> {
        let path = self.stream_path(stream);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => {
                debug!(stream = %stream, path = %path.display(), "Created log stream");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(TelemetryError::StreamAlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_entry(&self, stream: &StreamKey, entry: &LogEntry) -> Result<(), TelemetryError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        // No `create`: writing to a stream that was never ensured is an error
        let mut file = OpenOptions::new().append(true).open(self.stream_path(stream)).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
