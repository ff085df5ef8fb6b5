use super::args;
use super::probe::StartOffset;
use crate::process::{self, ProcessError};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrimError {
    #[error("recording {0} does not exist")]
    Missing(PathBuf),

    #[error("failed to create temp file in {dir}: {source}")]
    TempFile {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("re-encode exited with {status}: {output}")]
    Encode { status: ExitStatus, output: String },

    #[error("failed to replace {path}: {source}")]
    Replace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Removes the blank lead-in of a finished recording.
///
/// The re-encode writes to a temp file beside the original; only a successful
/// encode is renamed over it. Every earlier failure leaves the original as is.
pub struct Trimmer {
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl Trimmer {
    pub fn new(ffmpeg: PathBuf, timeout: Duration) -> Self {
        Self { ffmpeg, timeout }
    }

    pub async fn trim(&self, path: &Path, offset: StartOffset) -> Result<(), TrimError> {
        if !path.is_file() {
            return Err(TrimError::Missing(path.to_path_buf()));
        }

        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let suffix = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_else(|| ".mp4".to_string());

        // Removed on drop unless persisted
        let temp = tempfile::Builder::new()
            .prefix(".trim-")
            .suffix(&suffix)
            .tempfile_in(dir)
            .map_err(|source| TrimError::TempFile {
                dir: dir.to_path_buf(),
                source,
            })?;

        tracing::info!(
            "Trimming {:?} from {:.3}s (offset {})",
            path,
            offset.trim_point(),
            offset
        );

        let output = process::run_sync(
            &self.ffmpeg,
            args::trim_args(path, offset.trim_point(), temp.path()),
            self.timeout,
        )
        .await?;

        if !output.success() {
            return Err(TrimError::Encode {
                status: output.status,
                output: output.output,
            });
        }

        match std::fs::metadata(path) {
            Ok(meta) => {
                if let Err(e) = std::fs::set_permissions(temp.path(), meta.permissions()) {
                    tracing::warn!("Failed to copy permissions onto trimmed file: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to read permissions of {:?}: {}", path, e),
        }

        temp.persist(path).map_err(|e| TrimError::Replace {
            path: path.to_path_buf(),
            source: e.error,
        })?;

        tracing::info!("Trimmed recording saved to {:?}", path);
        Ok(())
    }
}
