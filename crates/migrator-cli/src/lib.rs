//! One-shot migration control plane.
//!
//! Embed through [`run_cli`]; the `migrator` binary is a thin wrapper around it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use migrator_core::{
    orient, DualWritePool, DualWriteTelemetrySnapshot, EventProducer, EventSource, RowEntity,
    SqlValue, Store, WritePolicy, DEFAULT_DIRECTION,
};
use migrator_engine::{
    ConsumerConfig, Fixer, FixerConsumer, Validator, ValidatorConfig, DEFAULT_BATCH_SIZE,
    DEFAULT_CONSUMER, DEFAULT_MAX_FIX_ATTEMPTS,
};
use migrator_store_sqlite::{SqliteEventBus, SqliteStore};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "migrator")]
#[command(about = "Live table migration: validate, repair and dual-write")]
pub struct Cli {
    #[arg(long)]
    base: PathBuf,

    #[arg(long)]
    target: PathBuf,

    #[arg(long, default_value = "./migrator_bus.sqlite3")]
    bus: PathBuf,

    #[arg(long)]
    table: String,

    /// Event topic; defaults to `migrator_<table>`.
    #[arg(long)]
    topic: Option<String>,

    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Validate(ValidateArgs),
    Fix {
        #[command(subcommand)]
        command: FixCommand,
    },
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
    Columns,
    Exec(ExecArgs),
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[arg(long)]
    incremental: bool,
    #[arg(long, default_value_t = 0)]
    watermark: i64,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    #[arg(long, default_value = DEFAULT_DIRECTION)]
    direction: String,
}

#[derive(Debug, Subcommand)]
pub enum FixCommand {
    Drain(DrainArgs),
}

#[derive(Debug, Args)]
pub struct DrainArgs {
    #[arg(long, default_value = DEFAULT_CONSUMER)]
    consumer: String,
    #[arg(long, default_value = DEFAULT_DIRECTION)]
    direction: String,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_FIX_ATTEMPTS)]
    max_fix_attempts: u32,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
    Lag(EventsLagArgs),
    DeadLetters(EventsLagArgs),
}

/// Operator write policy persisted in the bus database, shared with the control service.
#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show,
    Set {
        /// `base_only`, `base_first`, `target_first`, `target_only` (or `SRC_*`/`DST_*`).
        policy: String,
    },
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long, default_value_t = 0)]
    from_seq: i64,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct EventsLagArgs {
    #[arg(long, default_value = DEFAULT_CONSUMER)]
    consumer: String,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Overrides the persisted policy for this call only.
    #[arg(long)]
    policy: Option<String>,
    #[arg(long)]
    statement: String,
    /// Positional parameter: integer, real, `null`, or text. `text:` forces text.
    #[arg(long = "param", allow_hyphen_values = true)]
    params: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct PolicyReport {
    topic: String,
    policy: WritePolicy,
    persisted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ExecReport {
    policy: WritePolicy,
    rows_affected: usize,
    telemetry: DualWriteTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ColumnsReport {
    table: String,
    columns: Vec<String>,
}

struct Stores {
    base: Arc<dyn Store>,
    target: Arc<dyn Store>,
}

impl Cli {
    fn topic(&self) -> String {
        self.topic.clone().unwrap_or_else(|| format!("migrator_{}", self.table))
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn open_stores(&self) -> Result<Stores> {
        let base = SqliteStore::open(&self.base).context("failed to open base store")?;
        let target = SqliteStore::open(&self.target).context("failed to open target store")?;
        Ok(Stores { base: Arc::new(base), target: Arc::new(target) })
    }

    fn open_bus(&self) -> Result<Arc<SqliteEventBus>> {
        let bus = SqliteEventBus::open(&self.bus, &self.topic())?;
        bus.migrate()?;
        Ok(Arc::new(bus))
    }
}

impl Stores {
    fn oriented(&self, direction: &str) -> Result<(Arc<dyn Store>, Arc<dyn Store>)> {
        Ok(orient(direction, &self.base, &self.target)?)
    }
}

/// The persisted policy, or `base_only` when none has been saved yet.
fn persisted_policy(bus: &SqliteEventBus) -> Result<(WritePolicy, bool)> {
    match bus.load_policy_code()? {
        Some(code) => {
            let policy = WritePolicy::from_code(code)
                .ok_or_else(|| anyhow!("persisted write policy code {code} is unknown"))?;
            Ok((policy, true))
        }
        None => Ok((WritePolicy::BaseOnly, false)),
    }
}

/// Executes the parsed CLI on a fresh multi-thread runtime.
///
/// # Errors
/// Returns an error when a store or the bus cannot be opened, arguments are invalid, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run_command(cli))
}

async fn run_command(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Validate(args) => run_validate(&cli, args).await,
        Command::Fix { command: FixCommand::Drain(args) } => run_drain(&cli, args).await,
        Command::Events { command } => run_events(&cli, command),
        Command::Columns => {
            let stores = cli.open_stores()?;
            let columns = stores.base.columns(&cli.table)?;
            print_json(&ColumnsReport { table: cli.table.clone(), columns })
        }
        Command::Exec(args) => run_exec(&cli, args),
        Command::Policy { command } => run_policy(&cli, command),
    }
}

async fn run_validate(cli: &Cli, args: &ValidateArgs) -> Result<()> {
    let stores = cli.open_stores()?;
    let (base, target) = stores.oriented(&args.direction)?;
    let bus = cli.open_bus()?;

    let mut config = ValidatorConfig {
        direction: args.direction.clone(),
        batch_size: args.batch_size,
        call_timeout: cli.call_timeout(),
        ..ValidatorConfig::for_table(cli.table.clone())
    };
    if args.incremental {
        config = config.incremental(args.watermark);
    }

    let validator = Validator::<RowEntity>::new(base, target, bus as Arc<dyn EventProducer>, config)?;
    let (_stop, cancel) = watch::channel(false);
    let report = validator.validate(cancel).await;
    print_json(&report)
}

async fn run_drain(cli: &Cli, args: &DrainArgs) -> Result<()> {
    let stores = cli.open_stores()?;
    let (base, target) = stores.oriented(&args.direction)?;
    let bus = cli.open_bus()?;

    let fixer = Fixer::new(base, target, &cli.table, cli.call_timeout()).await?;
    let config = ConsumerConfig {
        consumer: args.consumer.clone(),
        direction: args.direction.clone(),
        batch_size: args.batch_size,
        call_timeout: cli.call_timeout(),
        max_fix_attempts: args.max_fix_attempts,
        ..ConsumerConfig::default()
    };
    let consumer = FixerConsumer::new(fixer, bus as Arc<dyn EventSource>, config);
    let report = consumer.drain().await?;
    info!(
        fixed = report.fixed(),
        failed = report.failed,
        dead_lettered = report.dead_lettered,
        "drain finished"
    );
    print_json(&report)
}

fn run_events(cli: &Cli, command: &EventsCommand) -> Result<()> {
    let bus = cli.open_bus()?;
    match command {
        EventsCommand::List(args) => print_json(&bus.list_events(args.from_seq, args.limit)?),
        EventsCommand::Lag(args) => print_json(&bus.consumer_lag(&args.consumer)?),
        EventsCommand::DeadLetters(args) => print_json(&bus.list_dead_letters(&args.consumer)?),
    }
}

fn run_policy(cli: &Cli, command: &PolicyCommand) -> Result<()> {
    let bus = cli.open_bus()?;
    match command {
        PolicyCommand::Show => {
            let (policy, persisted) = persisted_policy(&bus)?;
            print_json(&PolicyReport { topic: bus.topic().to_string(), policy, persisted })
        }
        PolicyCommand::Set { policy } => {
            let policy: WritePolicy = policy.parse()?;
            bus.save_policy_code(policy.code())?;
            info!(topic = %bus.topic(), policy = policy.as_str(), "write policy persisted");
            print_json(&PolicyReport { topic: bus.topic().to_string(), policy, persisted: true })
        }
    }
}

fn run_exec(cli: &Cli, args: &ExecArgs) -> Result<()> {
    let policy: WritePolicy = match &args.policy {
        Some(name) => name.parse()?,
        None => persisted_policy(&*cli.open_bus()?)?.0,
    };
    let stores = cli.open_stores()?;
    let pool = DualWritePool::new(stores.base, stores.target, policy);
    let params: Vec<SqlValue> = args.params.iter().map(String::as_str).map(parse_param).collect();
    let rows_affected = pool.execute(&args.statement, &params)?;
    print_json(&ExecReport { policy, rows_affected, telemetry: pool.telemetry() })
}

fn parse_param(raw: &str) -> SqlValue {
    if let Some(text) = raw.strip_prefix("text:") {
        return SqlValue::Text(text.to_string());
    }
    if raw.eq_ignore_ascii_case("null") {
        return SqlValue::Null;
    }
    if let Ok(value) = raw.parse::<i64>() {
        return SqlValue::Integer(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        return SqlValue::Real(value);
    }
    SqlValue::Text(raw.to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
