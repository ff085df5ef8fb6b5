use crate::messages::{Inbound, STATUS_TOPIC};
use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Split one `<topic> <payload>` line. Blank lines carry nothing.
pub fn parse_line(line: &str) -> Option<Inbound> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (topic, payload) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    Some(Inbound {
        topic: topic.to_string(),
        payload: payload.trim().to_string(),
    })
}

/// Read control messages line by line and forward them until input ends.
///
/// Stands in for the broker subscription: every line is `<topic> <payload>`,
/// for example `camera/control/action record 10`.
pub async fn read_commands<R>(reader: R, tx: mpsc::Sender<Inbound>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read control message")?
    {
        let Some(message) = parse_line(&line) else {
            continue;
        };

        tracing::debug!("Received on {}: {:?}", message.topic, message.payload);
        if tx.send(message).await.is_err() {
            break;
        }
    }

    tracing::info!("Control input closed");
    Ok(())
}

/// Print each status as a `camera/status <message>` line
pub async fn write_statuses<W>(mut rx: mpsc::UnboundedReceiver<String>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = format!("{} {}\n", STATUS_TOPIC, message.replace('\n', " | "));
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write status")?;
        writer.flush().await.context("Failed to flush status")?;
    }

    Ok(())
}
