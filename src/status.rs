use async_trait::async_trait;
use tokio::sync::mpsc;

/// Most characters of process output quoted in a status message
const OUTPUT_QUOTE_LIMIT: usize = 400;

/// Outbound status channel
///
/// Messages are free-form text, conventionally prefixed with `SUCCESS:` or
/// `ERROR:`; plain text is progress.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, message: &str);
}

pub fn success(message: impl AsRef<str>) -> String {
    format!("SUCCESS: {}", message.as_ref())
}

pub fn error(message: impl AsRef<str>) -> String {
    format!("ERROR: {}", message.as_ref())
}

/// The end of a process's output, which is where ffmpeg puts the reason it failed
pub fn quote_output(output: &str) -> String {
    let trimmed = output.trim();
    let count = trimmed.chars().count();
    if count <= OUTPUT_QUOTE_LIMIT {
        return trimmed.to_string();
    }

    let tail: String = trimmed.chars().skip(count - OUTPUT_QUOTE_LIMIT).collect();
    format!("...{}", tail)
}

/// Forwards statuses into a channel, for transports that publish from their own task
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl StatusPublisher for ChannelPublisher {
    async fn publish(&self, message: &str) {
        tracing::info!("Status: {}", message);
        if self.tx.send(message.to_string()).is_err() {
            tracing::warn!("Status channel closed, dropped: {}", message);
        }
    }
}
