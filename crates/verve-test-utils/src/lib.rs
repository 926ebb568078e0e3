//! Postgres fixtures for verve integration tests.
//!
//! Tests share one Postgres server and isolate themselves by creating a
//! throwaway database each. The server is either whatever
//! `VERVE_TEST_PG_URL` points at (CI) or a testcontainers instance started
//! on first use and kept for the life of the test binary.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

enum PgServer {
    /// CI-provided server; nothing to keep alive.
    External(String),
    /// Container owned by this process; the handle keeps it running.
    Container {
        url: String,
        _keep: ContainerAsync<Postgres>,
    },
}

impl PgServer {
    fn url(&self) -> &str {
        match self {
            Self::External(url) => url,
            Self::Container { url, .. } => url,
        }
    }
}

static PG: OnceCell<PgServer> = OnceCell::const_new();

/// Base URL of the shared server (no database path).
async fn server_url() -> &'static str {
    PG.get_or_init(|| async {
        if let Ok(url) = std::env::var("VERVE_TEST_PG_URL") {
            return PgServer::External(url);
        }
        let container = Postgres::default()
            .with_tag("17")
            .start()
            .await
            .expect("failed to start Postgres test container");
        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");
        PgServer::Container {
            url: format!("postgresql://postgres:postgres@{host}:{port}"),
            _keep: container,
        }
    })
    .await
    .url()
}

async fn admin_connection() -> PgConnection {
    let url = format!("{}/postgres", server_url().await);
    PgConnection::connect(&url)
        .await
        .expect("failed to connect to test server admin database")
}

/// One migrated throwaway database. Call [`TestDb::teardown`] at the end
/// of the test; a leaked database only lives as long as the container.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    pub async fn new() -> Self {
        let name = format!("verve_{}", Uuid::new_v4().simple());

        let mut admin = admin_connection().await;
        admin
            .execute(format!("CREATE DATABASE \"{name}\"").as_str())
            .await
            .unwrap_or_else(|e| panic!("CREATE DATABASE {name} failed: {e}"));
        admin.close().await.ok();

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/{name}", server_url().await))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {name}: {e}"));

        verve_db::pool::migrate(&pool)
            .await
            .expect("migrations should apply cleanly");

        Self { pool, name }
    }

    /// Close the pool and drop the database. `WITH (FORCE)` kicks out any
    /// straggler connections, so this never races pool shutdown.
    pub async fn teardown(self) {
        self.pool.close().await;
        let mut admin = admin_connection().await;
        let _ = admin
            .execute(format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.name).as_str())
            .await;
        admin.close().await.ok();
    }
}
