//! Postgres NOTIFY/LISTEN plumbing for the cross-process event bridge.
//!
//! The broker's publish side calls [`notify_event`]; a server replica runs
//! [`listen_events`] in a background task and feeds each payload back into
//! its local broker. Only publishers notify and only the listen loop fans
//! out locally, so an event is never re-broadcast.

use anyhow::{Context, Result};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default channel name for the event bridge.
pub const DEFAULT_EVENT_CHANNEL: &str = "verve_events";

/// Publish a payload on a Postgres notification channel.
///
/// `pg_notify` payloads are capped at 8000 bytes; callers are expected to
/// keep event JSON small (task events elide logs).
pub async fn notify_event(pool: &PgPool, channel: &str, payload: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(pool)
        .await
        .context("failed to publish notification")?;

    Ok(())
}

/// Listen on a notification channel and forward payloads to `tx` until
/// cancelled. Recoverable listener errors are logged and the loop
/// reconnects; the receiver closing ends the loop.
pub async fn listen_events(
    pool: &PgPool,
    channel: &str,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut listener = PgListener::connect_with(pool)
        .await
        .context("failed to connect notification listener")?;
    listener
        .listen(channel)
        .await
        .with_context(|| format!("failed to listen on channel {channel}"))?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            notification = listener.recv() => {
                match notification {
                    Ok(n) => {
                        if tx.send(n.payload().to_owned()).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        // PgListener reconnects internally on the next recv;
                        // just surface the hiccup.
                        warn!(error = %e, channel = %channel, "notification listener error");
                    }
                }
            }
        }
    }
}
