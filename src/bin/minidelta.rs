//! minidelta command-line interface
//!
//! Operates on the finance application's entity tables:
//! - Record operations (insert, get, update, delete, list, count)
//! - Streaming export as JSON lines
//! - Maintenance (vacuum, compact, stats)
//! - Sample data (seed)
//!
//! # Examples
//!
//! ```bash
//! # Insert a transaction
//! minidelta insert transactions -s description=Rent -s amount=1200 -s date=2024-05-01 \
//!     -s type=expense -s account_id=1 -s category_id=6 -s user_id=1
//!
//! # Second page of a user's transactions
//! minidelta list transactions --page 2 --size 10 --filter user_id=1
//!
//! # Drop data older than a day
//! minidelta vacuum --retention-hours 24
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use minidelta::storage::{CancelFlag, Predicate, Record, Schema, Store, Table, Value};
use minidelta::{metrics, Entity, StoreConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// minidelta - append-only table storage for personal finance data
#[derive(Parser, Debug)]
#[command(name = "minidelta")]
#[command(version = minidelta::VERSION)]
#[command(about = "Append-only table storage for personal finance data", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "MINIDELTA_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory path, overrides the configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "MINIDELTA_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Insert a record, printing it with its id
    Insert {
        entity: Entity,
        /// Column value as column=value (repeatable)
        #[arg(short, long = "set", value_name = "COLUMN=VALUE")]
        set: Vec<String>,
    },

    /// Print the record with the given id
    Get { entity: Entity, id: i64 },

    /// Change columns of an existing record
    Update {
        entity: Entity,
        id: i64,
        #[arg(short, long = "set", value_name = "COLUMN=VALUE")]
        set: Vec<String>,
    },

    /// Delete the record with the given id
    Delete { entity: Entity, id: i64 },

    /// Print one page of records
    List {
        entity: Entity,
        #[arg(short, long, default_value = "1")]
        page: usize,
        #[arg(short, long, default_value = "10")]
        size: usize,
        /// Equality filter, column=value[,column=value]
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Count records
    Count {
        entity: Entity,
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Write every record as JSON lines
    Export {
        entity: Entity,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove data files no retained snapshot needs
    Vacuum {
        /// Single entity (all if omitted)
        entity: Option<Entity>,
        /// Keep removed files this long (defaults to the configured retention)
        #[arg(long)]
        retention_hours: Option<u64>,
    },

    /// Rewrite small data files into larger ones
    Compact {
        entity: Option<Entity>,
        #[arg(long)]
        target_rows: Option<usize>,
    },

    /// Table statistics
    Stats { entity: Option<Entity> },

    /// Insert random transactions
    Seed {
        #[arg(short, long, default_value = "1000")]
        count: usize,
        /// RNG seed for reproducible data
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the effective configuration
    Config,

    /// Count every table and print the resulting metrics
    Metrics,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;
    metrics::init_metrics();

    let mut config = StoreConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Version => {
            println!("minidelta {}", minidelta::VERSION);
            Ok(())
        }
        command => {
            let store = Store::open(config)?;
            run(store, command).await
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "minidelta.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    // Console logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

async fn run(store: Store, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Insert { entity, set } => {
            let storage = store.storage(entity)?;
            let record = parse_assignments(&entity.schema()?, &set)?;
            let stored = storage.insert(record).await?;
            print_record(&stored)
        }
        Commands::Get { entity, id } => match store.storage(entity)?.get(id).await? {
            Some(record) => print_record(&record),
            None => anyhow::bail!("{} {} not found", entity, id),
        },
        Commands::Update { entity, id, set } => {
            let storage = store.storage(entity)?;
            let patch = parse_assignments(&entity.schema()?, &set)?;
            match storage.update(id, patch).await? {
                Some(record) => print_record(&record),
                None => anyhow::bail!("{} {} not found", entity, id),
            }
        }
        Commands::Delete { entity, id } => {
            if store.storage(entity)?.delete(id).await? {
                println!("Deleted {} {}", entity, id);
                Ok(())
            } else {
                anyhow::bail!("{} {} not found", entity, id)
            }
        }
        Commands::List {
            entity,
            page,
            size,
            filter,
        } => {
            let predicate = parse_filter(entity, filter.as_deref())?;
            let rows = store.storage(entity)?.paginate(page, size, predicate).await?;
            for row in &rows {
                print_record(row)?;
            }
            Ok(())
        }
        Commands::Count { entity, filter } => {
            let predicate = parse_filter(entity, filter.as_deref())?;
            println!("{}", store.storage(entity)?.count(predicate).await?);
            Ok(())
        }
        Commands::Export { entity, output } => export_command(&store, entity, output).await,
        Commands::Vacuum {
            entity,
            retention_hours,
        } => {
            let retention = retention_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or_else(|| store.config().default_retention());
            for entity in selected(entity) {
                vacuum_command(&store, entity, retention).await?;
            }
            Ok(())
        }
        Commands::Compact {
            entity,
            target_rows,
        } => {
            let target = target_rows.unwrap_or(store.config().compact_target_rows);
            for entity in selected(entity) {
                let report = store.storage(entity)?.compact(target).await?;
                println!(
                    "{}: {} files rewritten into {} ({} rows)",
                    entity, report.files_removed, report.files_added, report.rows_rewritten
                );
            }
            Ok(())
        }
        Commands::Stats { entity } => {
            println!(
                "{:<14} {:>8} {:>8} {:>10} {:>8} {:>10} {:>12}",
                "TABLE", "VERSION", "FILES", "ROWS", "DELETES", "TOMBSTONES", "BYTES"
            );
            for entity in selected(entity) {
                let stats = store.storage(entity)?.stats().await?;
                println!(
                    "{:<14} {:>8} {:>8} {:>10} {:>8} {:>10} {:>12}",
                    entity.name(),
                    stats.version,
                    stats.active_files,
                    stats.stored_rows,
                    stats.delete_markers,
                    stats.tombstones,
                    stats.active_bytes
                );
            }
            Ok(())
        }
        Commands::Seed { count, seed } => {
            let table = store.entity(Entity::Transactions)?;
            let inserted =
                tokio::task::spawn_blocking(move || seed_transactions(&table, count, seed))
                    .await??;
            println!("{} transactions inserted", inserted);
            Ok(())
        }
        Commands::Metrics => {
            for name in store.existing()? {
                if let Some(entity) = Entity::all().into_iter().find(|e| e.name() == name) {
                    store.storage(entity)?.count(None).await?;
                }
            }
            print!("{}", metrics::export_metrics());
            Ok(())
        }
        Commands::Config | Commands::Version => Ok(()),
    }
}

fn selected(entity: Option<Entity>) -> Vec<Entity> {
    match entity {
        Some(entity) => vec![entity],
        None => Entity::all().to_vec(),
    }
}

async fn export_command(store: &Store, entity: Entity, output: Option<PathBuf>) -> anyhow::Result<()> {
    let mut writer: Box<dyn Write> = match &output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(std::io::BufWriter::new(std::io::stdout())),
    };

    let mut rx = store.storage(entity)?.export().await?;
    let mut written = 0u64;
    while let Some(record) = rx.recv().await {
        serde_json::to_writer(&mut writer, &record?)?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;
    info!(entity = %entity, records = written, "Export complete");
    Ok(())
}

/// Vacuum one table, cancelling cleanly on Ctrl-C
async fn vacuum_command(store: &Store, entity: Entity, retention: Duration) -> anyhow::Result<()> {
    let table = Arc::new(store.entity(entity)?);
    let cancel = CancelFlag::new();

    let worker = {
        let table = Arc::clone(&table);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || table.vacuum_with(retention, Some(&cancel)))
    };
    tokio::pin!(worker);

    let report = tokio::select! {
        result = &mut worker => result??,
        _ = tokio::signal::ctrl_c() => {
            warn!(entity = %entity, "Interrupted, cancelling vacuum");
            cancel.cancel();
            worker.await??
        }
    };

    println!(
        "{}: {} files tombstoned, {} files removed, {} bytes freed",
        entity,
        report.files_tombstoned,
        report.files_removed.len(),
        report.bytes_freed
    );
    Ok(())
}

fn parse_assignments(schema: &Schema, assignments: &[String]) -> anyhow::Result<Record> {
    let mut record = Record::new();
    for assignment in assignments {
        let (column, text) = assignment
            .split_once('=')
            .with_context(|| format!("Expected COLUMN=VALUE, got '{}'", assignment))?;
        let column = column.trim();
        record.insert(column.to_string(), schema.parse_value(column, text)?);
    }
    Ok(record)
}

fn parse_filter(entity: Entity, filter: Option<&str>) -> anyhow::Result<Option<Predicate>> {
    match filter {
        Some(text) => Ok(Some(Predicate::parse(&entity.schema()?, text)?)),
        None => Ok(None),
    }
}

fn print_record(record: &Record) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(record)?);
    Ok(())
}

const DESCRIPTIONS: [&str; 10] = [
    "Supermarket",
    "Gym membership",
    "Rent payment",
    "Streaming subscription",
    "Clothing",
    "Fuel",
    "Doctor appointment",
    "Concert ticket",
    "Online course",
    "Pharmacy",
];

const CATEGORY_COUNT: i64 = 6;

/// Insert `count` random transactions in batches of one commit each
fn seed_transactions(table: &Table, count: usize, seed: Option<u64>) -> anyhow::Result<usize> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let today = chrono::Utc::now().date_naive();

    let mut inserted = 0;
    while inserted < count {
        let batch: Vec<Record> = (inserted..count.min(inserted + 100))
            .map(|_| {
                let amount = (rng.gen_range(10.0..5000.0_f64) * 100.0).round() / 100.0;
                let date = today - chrono::Duration::days(rng.gen_range(0..365));
                let kind = if rng.gen_bool(0.5) { "income" } else { "expense" };
                minidelta::storage::record([
                    ("description", Value::from(DESCRIPTIONS[rng.gen_range(0..DESCRIPTIONS.len())])),
                    ("amount", Value::from(amount)),
                    ("date", Value::from(date.format("%Y-%m-%d").to_string())),
                    ("type", Value::from(kind)),
                    ("account_id", Value::from(rng.gen_range(1..=10_i64))),
                    ("category_id", Value::from(rng.gen_range(1..=CATEGORY_COUNT))),
                    ("user_id", Value::from(rng.gen_range(1..=20_i64))),
                ])
            })
            .collect();
        inserted += table.insert_many(batch)?.len();
    }
    info!(count = inserted, "Seeded transactions");
    Ok(inserted)
}
