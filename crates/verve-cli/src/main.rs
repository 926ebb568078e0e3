mod config;
mod serve;
mod work_cmd;

use clap::{Parser, Subcommand};

use verve_db::pool;

use config::VerveConfig;

#[derive(Parser)]
#[command(name = "verve", about = "Distributed dispatcher for AI coding agents")]
struct Cli {
    /// Database URL (overrides VERVE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a verve config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/verve")]
        db_url: String,
        /// GitHub token used for worker credentials and PR reconciliation
        #[arg(long)]
        github_token: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the verve database (create + migrate)
    DbInit,
    /// Run the dispatch server
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Postgres notification channel bridging events between replicas
        #[arg(long)]
        events_channel: Option<String>,
    },
    /// Run a worker process
    Work {
        /// Dispatch server base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
        /// Agent container image (must be present locally)
        #[arg(long, default_value = "verve-agent:latest")]
        image: String,
        /// Max tasks to run in parallel
        #[arg(long, default_value_t = 1)]
        max_concurrent: usize,
        /// Restrict to these repo ids (repeatable)
        #[arg(long = "repo")]
        repos: Vec<String>,
        /// Tell the agent not to push anything
        #[arg(long)]
        dry_run: bool,
    },
}

/// Execute `verve init`: write the config file.
fn cmd_init(db_url: &str, github_token: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_owned(),
        },
        github: config::GithubSection {
            token: github_token.unwrap_or_default().to_owned(),
        },
        events: config::EventsSection::default(),
    };

    let written = config::save_config(&cfg)?;
    println!("Config written to {}", written.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `verve db-init` to create and migrate the database.");

    Ok(())
}

/// Execute `verve db-init`: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = VerveConfig::resolve(cli_db_url)?;

    println!("Initializing verve database...");

    let db_pool = pool::bootstrap(&resolved.db_config).await?;

    let summary = pool::summarize(&db_pool).await?;
    let total: i64 = summary.tasks_by_status.iter().map(|(_, n)| n).sum();
    println!("Store ready: {total} tasks, {} log batches.", summary.log_batches);
    for (status, count) in &summary.tasks_by_status {
        println!("  {status}: {count}");
    }

    db_pool.close().await;
    println!("verve db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            github_token,
            force,
        } => {
            cmd_init(&db_url, github_token.as_deref(), force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve {
            bind,
            port,
            events_channel,
        } => {
            let resolved = VerveConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let options = serve::ServeOptions {
                bind,
                port,
                github_token: resolved.github_token,
                events_channel: events_channel.or(resolved.db_config.notify_channel),
            };
            serve::run_serve(db_pool, options).await?;
        }
        Commands::Work {
            server,
            image,
            max_concurrent,
            repos,
            dry_run,
        } => {
            work_cmd::run_work(work_cmd::WorkOptions {
                server_url: server,
                image,
                max_concurrent,
                repos,
                dry_run,
            })
            .await?;
        }
    }

    Ok(())
}
