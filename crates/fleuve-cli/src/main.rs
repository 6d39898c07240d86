// Fleuve CLI
//
// Design Decision: clap derive with env-backed arguments, so container
// deployments configure everything through DATABASE_URL / NATS_URL.
// Design Decision: the binary exits non-zero on any startup failure and
// zero on clean shutdown.

mod server;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fleuve_engine::cache::NatsStateCache;
use fleuve_engine::persistence::{EventStore, PostgresEventStore};

#[derive(Parser)]
#[command(name = "fleuve")]
#[command(about = "Fleuve workflow engine tooling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring server
    Ui {
        /// Bind host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Bind port
        #[arg(long, default_value_t = 8001)]
        port: u16,

        /// PostgreSQL connection string
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,

        /// NATS server for the shared state cache (optional)
        #[arg(long, env = "NATS_URL")]
        nats_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ui {
            host,
            port,
            database_url,
            nats_url,
        } => ui(host, port, database_url, nats_url).await,
    }
}

async fn ui(
    host: String,
    port: u16,
    database_url: String,
    nats_url: Option<String>,
) -> anyhow::Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to DATABASE_URL")?;

    let store = PostgresEventStore::new(pool);
    store
        .migrate()
        .await
        .context("failed to apply engine schema")?;

    // NATS is the engine's state cache; the monitoring server only checks
    // it is reachable and reports that in /healthz.
    let nats_connected = match nats_url.as_deref() {
        Some(url) => match NatsStateCache::connect(url, "fleuve-state").await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "NATS_URL set but unreachable");
                false
            }
        },
        None => false,
    };

    let store: Arc<dyn EventStore> = Arc::new(store);
    info!(%host, port, nats_connected, "starting monitoring server");

    server::serve(
        server::AppState {
            store,
            nats_connected,
        },
        &host,
        port,
    )
    .await
}
