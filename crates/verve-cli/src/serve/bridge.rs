//! Wiring between the in-process broker and the Postgres notification
//! channel (the multi-replica event bridge).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use verve_core::event::{Event, EventBroker, Notifier};
use verve_db::notify;

/// Broker [`Notifier`] that writes event JSON to a Postgres channel.
pub struct PgNotifier {
    pool: PgPool,
    channel: String,
}

impl PgNotifier {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn notify(&self, payload: &str) -> anyhow::Result<()> {
        notify::notify_event(&self.pool, &self.channel, payload).await
    }
}

/// Spawn the listen side of the bridge: payloads arriving on the channel
/// are decoded and handed to [`EventBroker::receive`] for local fan-out.
pub fn spawn_listener(
    pool: PgPool,
    channel: String,
    broker: Arc<EventBroker>,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel::<String>(256);

    tokio::spawn({
        let cancel = cancel.clone();
        let channel = channel.clone();
        async move {
            if let Err(e) = notify::listen_events(&pool, &channel, tx, cancel).await {
                warn!(error = %e, channel = %channel, "event listener exited");
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                payload = rx.recv() => {
                    let Some(payload) = payload else { return };
                    match serde_json::from_str::<Event>(&payload) {
                        Ok(event) => broker.receive(event),
                        Err(e) => warn!(error = %e, "discarding malformed event payload"),
                    }
                }
            }
        }
    });
}
