use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use repolens_storage::{ConfigStore, RepoStore, SqliteConfigStore, SqliteRepoStore};
use repolens_sync::{ConfigSourceClient, ConfigSummarizer, Scheduler};
use repolens_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_DATABASE_URL: &str = "sqlite://repolens.db";

#[derive(Debug, Parser)]
#[command(name = "repolens")]
#[command(about = "GitHub repository collector with AI summaries")]
struct Cli {
    /// Database url; falls back to the DATABASE_URL environment variable.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web server and the periodic batch fetcher.
    Serve {
        #[arg(long, default_value = "0.0.0.0:3000")]
        addr: String,
    },
    /// Run one batch fetch inline and exit.
    Sync,
    /// Apply pending database migrations and exit.
    Migrate,
}

impl Cli {
    fn database_url(&self) -> String {
        self.database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let database_url = cli.database_url();
    let pool = repolens_storage::init_pool(&database_url).await?;
    let store: Arc<dyn RepoStore> = Arc::new(SqliteRepoStore::new(pool.clone()));
    let config: Arc<dyn ConfigStore> = Arc::new(SqliteConfigStore::new(pool));

    match cli.command.unwrap_or(Commands::Serve {
        addr: "0.0.0.0:3000".to_string(),
    }) {
        Commands::Serve { addr } => {
            let scheduler = Scheduler::new(
                Arc::clone(&store),
                Arc::clone(&config),
                Arc::new(ConfigSourceClient::new(Arc::clone(&config))),
                Arc::new(ConfigSummarizer::new(Arc::clone(&config))),
            );
            scheduler.spawn_timer();
            let state = AppState::new(store, config, scheduler);
            repolens_web::serve(state, &addr).await?;
        }
        Commands::Sync => {
            let scheduler = Scheduler::new(
                Arc::clone(&store),
                Arc::clone(&config),
                Arc::new(ConfigSourceClient::new(Arc::clone(&config))),
                Arc::new(ConfigSummarizer::new(Arc::clone(&config))),
            );
            scheduler.run_once().await;
            let status = scheduler.status();
            println!(
                "sync finished: state={:?} processed={}/{} message={}",
                status.state, status.processed, status.total, status.message
            );
        }
        Commands::Migrate => {
            // init_pool already ran the migrations.
            info!(%database_url, "database migrated");
            println!("migrations applied to {database_url}");
        }
    }

    Ok(())
}
