//! Log line batching.
//!
//! The worker streams container output line by line but ships it to the
//! server in batches: a flush happens when the buffer reaches
//! [`FLUSH_LINES`] lines or [`FLUSH_INTERVAL`] elapses, whichever comes
//! first, plus a final flush at end-of-stream.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use super::client::ApiClient;

/// Max lines buffered before a flush.
pub const FLUSH_LINES: usize = 50;

/// Max time a line sits in the buffer before a flush.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Consume lines from `rx` and ship them to the server in batches until
/// the channel closes. Ship failures are logged and dropped; logs are
/// best-effort and must never fail the attempt.
pub async fn pump_logs(
    client: &ApiClient,
    task_id: &str,
    attempt: i32,
    mut rx: mpsc::Receiver<String>,
) {
    let mut buffer: Vec<String> = Vec::with_capacity(FLUSH_LINES);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = rx.recv() => {
                match line {
                    Some(line) => {
                        buffer.push(line);
                        if buffer.len() >= FLUSH_LINES {
                            flush(client, task_id, attempt, &mut buffer).await;
                        }
                    }
                    None => {
                        // End of stream: final flush.
                        flush(client, task_id, attempt, &mut buffer).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(client, task_id, attempt, &mut buffer).await;
            }
        }
    }
}

async fn flush(client: &ApiClient, task_id: &str, attempt: i32, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let lines = std::mem::take(buffer);
    if let Err(e) = client.append_logs(task_id, attempt, &lines).await {
        warn!(task_id = %task_id, error = %e, dropped = lines.len(), "failed to ship log batch");
    }
}
