//! Trackbet settlement daemon.
//!
//! Wires the store, the results-service client and the settlement monitor
//! together and runs until interrupted. The web layer that creates clubs,
//! predictions and wagers lives elsewhere; this process only settles.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trackbet_backend::{
    models::Config,
    nadeo::{FetchedRecord, NadeoClient, NadeoCredentials, RecordsProvider},
    settlement::{automation, monitor::MonitorConfig},
    Db, PredictionMonitor,
};

#[derive(Parser, Debug)]
#[command(name = "trackbet", about = "Prediction settlement daemon")]
struct Args {
    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Settlement poll interval in seconds (overrides POLL_INTERVAL_SECS)
    #[arg(long)]
    poll_secs: Option<u64>,
}

/// Stand-in when no results-service credentials are configured. Every
/// resolution that needs a fetch stays pending until credentials appear.
struct DisabledProvider;

#[async_trait::async_trait]
impl RecordsProvider for DisabledProvider {
    async fn fetch_records(
        &self,
        _track: uuid::Uuid,
        _players: &[uuid::Uuid],
    ) -> Result<Vec<FetchedRecord>> {
        Err(anyhow::anyhow!("results service not configured"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(db_path) = args.db_path {
        config.database_path = db_path;
    }
    if let Some(poll_secs) = args.poll_secs {
        config.poll_interval_secs = poll_secs;
    }

    init_tracing();
    info!("🏁 Trackbet settlement engine starting");

    let db = Db::new(&config.database_path)
        .with_context(|| format!("open database at {}", config.database_path))?;
    info!(path = %config.database_path, "📊 database ready");

    let provider: Arc<dyn RecordsProvider> = match (&config.nadeo_user, &config.nadeo_password) {
        (Some(user), Some(password)) => {
            let client = NadeoClient::new(
                NadeoCredentials {
                    username: user.clone(),
                    password: password.clone(),
                    user_agent: config.nadeo_user_agent.clone(),
                },
                db.clone(),
                Duration::from_millis(config.nadeo_wait_ms),
                Duration::from_secs(config.fetch_timeout_secs),
            )?;
            info!(
                wait_ms = config.nadeo_wait_ms,
                "🌐 results service client ready"
            );
            Arc::new(client)
        }
        _ => {
            warn!("⚠️  NADEO_USER / NADEO_PASSWORD not set - results fetching disabled");
            warn!("⚠️  predictions needing a fetch will wait until credentials are configured");
            Arc::new(DisabledProvider)
        }
    };

    let monitor = Arc::new(PredictionMonitor::new(
        db.clone(),
        provider,
        MonitorConfig {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            raffle_seed: config.raffle_seed,
        },
    ));
    let monitor_handle = monitor.spawn();
    let automation_handle = automation::spawn(
        db,
        Duration::from_secs(config.automation_interval_secs),
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down; unprocessed predictions settle on next start");
    monitor_handle.abort();
    automation_handle.abort();

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trackbet=info,trackbet_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
