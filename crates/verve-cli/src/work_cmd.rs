//! The `verve work` command: run the worker loop until ctrl-c.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use verve_core::worker::{run_worker, WorkerConfig};

pub struct WorkOptions {
    pub server_url: String,
    pub image: String,
    pub max_concurrent: usize,
    pub repos: Vec<String>,
    pub dry_run: bool,
}

pub async fn run_work(options: WorkOptions) -> Result<()> {
    let mut config = WorkerConfig::new(options.server_url, options.image);
    config.max_concurrent = options.max_concurrent;
    config.repos = options.repos;
    config.dry_run = options.dry_run;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight tasks");
            signal_cancel.cancel();
        }
    });

    run_worker(config, cancel).await
}
