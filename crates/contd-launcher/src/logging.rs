//! Per-container log file tee.
//!
//! Grounded in `original_source/container/logging.go`'s `setupLogging`:
//! a single append-only `logs.log` under the container's log directory,
//! written to alongside whatever stdout/stderr destination the caller
//! supplied (there, `io.MultiWriter`; here, a small async pump).

use std::os::unix::fs::{DirBuilderExt as _, OpenOptionsExt as _};
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::config::LoggingConfig;
use crate::error::{LaunchError, Result};

const DIR_MODE: u32 = 0o774;
const FILE_MODE: u32 = 0o644;

pub struct LogTee {
    file: std::fs::File,
}

impl LogTee {
    pub fn create(config: &LoggingConfig) -> Result<Self> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&config.path)
            .map_err(LaunchError::io("creating container log directory"))?;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(FILE_MODE)
            .open(config.path.join("logs.log"))
            .map_err(LaunchError::io("opening container log file"))?;

        Ok(Self { file })
    }

    /// Pumps bytes from `source` into both the log file and `forward`
    /// until `source` reaches EOF or a write fails. Runs until the
    /// container's stdout/stderr pipe closes; intended to be spawned as a
    /// `ChildTask` per stream.
    pub async fn pump(self, mut source: impl AsyncRead + Unpin, forward: Pin<Box<dyn AsyncWrite + Send>>) {
        let mut log = tokio::fs::File::from_std(self.file);
        let mut forward = forward;
        let mut buf = [0u8; 8192];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if log.write_all(&buf[..n]).await.is_err() {
                debug!("log file write failed, continuing to forward");
            }
            if forward.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    }
}
