//! alq-daemon entry point.
//!
//! Intentionally thin: tracing, CLI, config, store connect, client wiring,
//! then the queue runner until SIGINT. Config load and store connect are
//! the only fatal failures; every other collaborator is constructed from
//! config alone and failures there surface per-tick in the runner.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use alq_db::PgStore;
use alq_queue::runner::shutdown_channel;
use alq_queue::{MessageBus, QueueDeps, QueueRunner, RunnerConfig};
use alq_remote::{BugzillaTracker, HttpBus, HttpOracle};

#[derive(Parser, Debug)]
#[command(name = "alq-daemon", about = "autoland queue daemon")]
struct Args {
    /// Drain the broker queue after confirmation, then exit.
    #[arg(long)]
    purge_queue: bool,

    /// Config layers, merged in order; later files override earlier ones.
    #[arg(long, num_args = 1..,
          default_values_t = [String::from("config.yaml"), String::from("config.local.yaml")])]
    config: Vec<String>,

    /// Anything else on the command line is accepted and ignored.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    _ignored: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();
    let args = Args::parse();

    let paths: Vec<&str> = args.config.iter().map(String::as_str).collect();
    let loaded = alq_config::load_layered(&paths).context("failed to load configuration")?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");
    let cfg = loaded.config;

    let bus = Arc::new(HttpBus::new(&cfg.bus));

    if args.purge_queue {
        return purge_queue(bus.as_ref(), &cfg.bus.queue).await;
    }

    // Store connect is fatal: the queue has no business running blind.
    let db_url = std::env::var(alq_db::ENV_DB_URL).unwrap_or_else(|_| cfg.store.database_url.clone());
    let pool = alq_db::connect(&db_url).await?;
    alq_db::migrate(&pool).await?;
    let store = Arc::new(PgStore::new(pool));

    let deps = QueueDeps {
        store,
        tracker: Arc::new(BugzillaTracker::new(&cfg.tracker)),
        oracle: Arc::new(HttpOracle::new(&cfg.oracle)),
        bus,
    };
    let runner_config = RunnerConfig {
        poll_interval: Duration::from_secs(cfg.tracker.poll_interval_secs),
        pump_interval: Duration::from_secs(cfg.daemon.pump_interval_secs),
        routing_key: cfg.bus.routing_key.clone(),
        dead_letter_path: PathBuf::from(&cfg.daemon.dead_letter_path),
    };

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
        let _ = shutdown_tx.send(true);
    });

    QueueRunner::new(deps, runner_config).run(shutdown_rx).await;
    Ok(())
}

/// Interactive queue purge. State is fully external, so exiting right after
/// the drain is safe.
async fn purge_queue(bus: &dyn MessageBus, queue: &str) -> anyhow::Result<()> {
    print!("Purge all pending messages from '{queue}'? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
        println!("aborted");
        return Ok(());
    }

    let dropped = bus
        .purge()
        .await
        .map_err(|e| anyhow::anyhow!("queue purge failed: {e}"))?;
    println!("purged {dropped} message(s) from {queue}");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
