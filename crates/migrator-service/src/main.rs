use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use migrator_core::{DualWritePool, Store, WritePolicy};
use migrator_engine::DEFAULT_CONSUMER;
use migrator_service::{app, fixer_consumers, ControlOptions, ControlState};
use migrator_store_sqlite::{SqliteEventBus, SqliteStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "migrator-service")]
#[command(about = "HTTP control surface for a live table migration")]
struct Args {
    #[arg(long)]
    base: PathBuf,
    #[arg(long)]
    target: PathBuf,
    #[arg(long, default_value = "./migrator_bus.sqlite3")]
    bus: PathBuf,
    #[arg(long)]
    table: String,
    /// Defaults to `migrator_<table>`.
    #[arg(long)]
    topic: Option<String>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Used only when no policy has been persisted for the topic yet.
    #[arg(long, default_value = "base_only")]
    initial_policy: String,
    #[arg(long, default_value = DEFAULT_CONSUMER)]
    consumer: String,
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
    #[arg(long, default_value_t = 1000)]
    incremental_sleep_ms: u64,
    #[arg(long, default_value_t = 5000)]
    stop_grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let initial_policy: WritePolicy = args.initial_policy.parse()?;
    let call_timeout = Duration::from_millis(args.timeout_ms);
    let topic = args.topic.clone().unwrap_or_else(|| format!("migrator_{}", args.table));

    let base: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&args.base).context("failed to open base store")?);
    let target: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&args.target).context("failed to open target store")?);
    let bus = SqliteEventBus::open(&args.bus, &topic)?;
    bus.migrate()?;
    let bus = Arc::new(bus);

    let pool = DualWritePool::new(base, target, initial_policy);
    let state = ControlState::new(
        pool.clone(),
        Arc::clone(&bus),
        ControlOptions {
            call_timeout,
            incremental_sleep: Duration::from_millis(args.incremental_sleep_ms),
            stop_grace: Duration::from_millis(args.stop_grace_ms),
            ..ControlOptions::for_table(args.table.as_str())
        },
    )?;

    let (shutdown, consumer_cancel) = watch::channel(false);
    let consumers = fixer_consumers(&pool, &bus, &args.table, &args.consumer, call_timeout).await?;
    let consumer_tasks: Vec<_> = consumers
        .into_iter()
        .map(|consumer| {
            let cancel = consumer_cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        })
        .collect();

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        table = %args.table,
        topic = %topic,
        policy = pool.policy().map_or("unknown", WritePolicy::as_str),
        "migrator control surface listening"
    );
    axum::serve(listener, app(state.clone())).with_graceful_shutdown(shutdown_signal()).await?;

    match state.stop_active_run().await {
        Ok(Some(report)) => info!(?report, "validation run stopped at shutdown"),
        Ok(None) => {}
        Err(err) => warn!(error = %format!("{err:#}"), "validation run did not stop before shutdown"),
    }
    if shutdown.send(true).is_err() {
        warn!("fixer consumers exited before shutdown");
    }
    for task in consumer_tasks {
        match task.await {
            Ok(report) => info!(
                upserted = report.upserted,
                deleted = report.deleted,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "fixer consumer stopped"
            ),
            Err(err) => error!(error = %err, "fixer consumer task failed"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install ctrl-c handler; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
