//! The `verve serve` command: HTTP/SSE adapter plus background loops.

pub mod bridge;
pub mod routes;
pub mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post, put};
use axum::Router;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use verve_core::creds::{HostCredentials, StaticTokenCredentials};
use verve_core::event::EventBroker;
use verve_core::reconciler::{self, github::GithubCodeHost, CodeHost, RECONCILE_INTERVAL};
use verve_core::service::sweeper::{run_sweeper, SWEEP_INTERVAL};
use verve_core::service::{TaskService, STALE_AFTER};
use verve_db::pg::PgTaskStore;

use routes::AppState;

/// Server options resolved by the CLI.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind: String,
    pub port: u16,
    pub github_token: Option<String>,
    pub events_channel: Option<String>,
}

/// Build the `/api/v1` router over the given state.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/repos/{repo_id}/tasks",
            post(routes::create_task).get(routes::list_repo_tasks),
        )
        .route("/tasks/poll", get(routes::poll))
        .route(
            "/tasks/{id}",
            get(routes::get_task)
                .patch(routes::update_task)
                .delete(routes::delete_task),
        )
        .route("/tasks/{id}/ready", put(routes::set_ready))
        .route("/tasks/{id}/dependency", delete(routes::remove_dependency))
        .route("/tasks/{id}/close", post(routes::close_task))
        .route("/tasks/{id}/stop", post(routes::stop_task))
        .route("/tasks/{id}/retry", post(routes::retry_task))
        .route("/tasks/{id}/start-over", post(routes::start_over))
        .route("/tasks/{id}/feedback", post(routes::feedback))
        .route("/tasks/{id}/sync", post(routes::sync_task))
        .route(
            "/tasks/{id}/logs",
            get(sse::task_logs).post(routes::append_logs),
        )
        .route("/tasks/{id}/heartbeat", post(routes::heartbeat))
        .route("/tasks/{id}/complete", post(routes::complete))
        .route("/events", get(sse::events));

    Router::new()
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until ctrl-c.
pub async fn run_serve(pool: PgPool, options: ServeOptions) -> Result<()> {
    let cancel = CancellationToken::new();

    // Broker, optionally bridged across replicas via Postgres NOTIFY.
    let broker = match &options.events_channel {
        Some(channel) => {
            info!(channel = %channel, "event bridge enabled");
            Arc::new(EventBroker::with_notifier(Arc::new(bridge::PgNotifier::new(
                pool.clone(),
                channel.clone(),
            ))))
        }
        None => Arc::new(EventBroker::new()),
    };
    if let Some(channel) = &options.events_channel {
        bridge::spawn_listener(
            pool.clone(),
            channel.clone(),
            Arc::clone(&broker),
            cancel.clone(),
        );
    }

    let store = Arc::new(PgTaskStore::new(pool));
    let service = Arc::new(TaskService::new(store, broker));

    let creds: Arc<dyn HostCredentials> = Arc::new(StaticTokenCredentials::new(
        options.github_token.clone().unwrap_or_default(),
    ));

    let host: Option<Arc<dyn CodeHost>> = match &options.github_token {
        Some(token) => Some(Arc::new(
            GithubCodeHost::new(token).context("failed to build GitHub client")?,
        )),
        None => {
            warn!("no GitHub token configured; PR reconciliation disabled");
            None
        }
    };

    // Background loops.
    tokio::spawn(run_sweeper(
        Arc::clone(&service),
        SWEEP_INTERVAL,
        STALE_AFTER,
        cancel.clone(),
    ));
    if let Some(host) = &host {
        tokio::spawn(reconciler::run_reconciler(
            Arc::clone(&service),
            Arc::clone(host),
            Arc::clone(&creds),
            RECONCILE_INTERVAL,
            cancel.clone(),
        ));
    }

    let state = AppState {
        service,
        creds,
        host,
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", options.bind, options.port)
        .parse()
        .context("invalid bind address")?;
    info!("verve serve listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    info!("verve serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
