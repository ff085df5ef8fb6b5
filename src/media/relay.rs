use super::args::{self, RelayParams};
use crate::process::{self, ProcessError};
use std::path::Path;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The continuous device -> stream relay every capture job reads from.
///
/// Runs once for the lifetime of the service. An exit is logged, never restarted.
pub struct Relay {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Relay {
    pub fn start(ffmpeg: &Path, params: &RelayParams) -> Result<Self, ProcessError> {
        tracing::info!(
            "Starting live relay {} -> {}",
            params.device,
            params.stream_url
        );

        let mut handle = process::start(ffmpeg, args::relay_args(params))?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                status = handle.exited() => match status {
                    Ok(status) => {
                        let output = handle.finish(status).await;
                        if output.success() {
                            tracing::info!("Relay exited normally");
                        } else {
                            tracing::error!(
                                "Relay exited with {}: {}",
                                output.status,
                                output.output.trim()
                            );
                        }
                    }
                    Err(e) => tracing::error!("Lost track of relay process: {}", e),
                },
                _ = token.cancelled() => {
                    if let Err(e) = handle.interrupt() {
                        tracing::warn!("Failed to interrupt relay: {}", e);
                    }
                    match handle.wait().await {
                        Ok(output) => tracing::info!("Relay stopped ({})", output.status),
                        Err(e) => tracing::warn!("Failed to reap relay: {}", e),
                    }
                }
            }
        });

        Ok(Self { shutdown, task })
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Relay supervisor failed: {}", e);
        }
    }
}
