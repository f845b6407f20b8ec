//! workdb CLI — operator interface to a work store.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use workdb::config::{Config, StoreOptions};
use workdb::telemetry::{TelemetryConfig, init_telemetry};
use workdb::{RecordId, WorkDatabase};

#[derive(Parser)]
#[command(name = "workdb", about = "Track units of computational work")]
struct Cli {
    /// Store file (overrides WORKDB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// TOML config file
    #[arg(long, global = true, conflicts_with = "db")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add one record per JSON object line, in a single transaction
    Add {
        /// Input file (stdin when omitted)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show record counts
    Status,
    /// Print pending records as JSON lines
    Pending {
        /// Maximum records to print
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Attach an output to a pending record
    Complete {
        id: RecordId,
        /// JSON object
        output: String,
    },
    /// Show a record
    Show { id: RecordId },
    /// Remove records whose input duplicates an earlier one
    Dedup,
    /// Write completed records as merged JSON lines
    Export {
        /// Destination (WORKDB_EXPORT when omitted)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workdb".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let mut db = WorkDatabase::open_with(&config.store_path, &config.options)
        .with_context(|| format!("failed to open {}", config.store_path.display()))?;

    let result = match cli.command {
        Command::Add { file } => cmd_add(&mut db, file),
        Command::Status => cmd_status(&db),
        Command::Pending { limit } => cmd_pending(&db, limit),
        Command::Complete { id, output } => cmd_complete(&mut db, id, &output),
        Command::Show { id } => cmd_show(&db, id),
        Command::Dedup => cmd_dedup(&mut db),
        Command::Export { path } => {
            let path = path
                .or(config.export_path.clone())
                .context("no export path given and WORKDB_EXPORT is not set")?;
            cmd_export(&db, path)
        }
    };

    db.close()?;
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    if let Some(path) = &cli.config {
        return Ok(Config::from_file(path)?);
    }
    match &cli.db {
        Some(store_path) => Ok(Config {
            store_path: store_path.clone(),
            export_path: std::env::var("WORKDB_EXPORT").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            options: StoreOptions::default(),
        }),
        None => Ok(Config::from_env()?),
    }
}

fn cmd_add(db: &mut WorkDatabase, file: Option<PathBuf>) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = match file {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(&path)
                .with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut inputs = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value =
            serde_json::from_str(&line).with_context(|| format!("line {}", n + 1))?;
        inputs.push(value);
    }

    let count = inputs.len();
    db.with_transaction(|db| {
        for input in inputs {
            db.add(input)?;
        }
        Ok(())
    })?;

    println!("Added {count} records.");
    Ok(())
}

fn cmd_status(db: &WorkDatabase) -> anyhow::Result<()> {
    let counts = db.counts()?;
    println!("total:     {}", counts.total);
    println!("completed: {}", counts.completed);
    println!("pending:   {}", counts.pending());
    Ok(())
}

fn cmd_pending(db: &WorkDatabase, limit: Option<usize>) -> anyhow::Result<()> {
    let pending = db.incomplete()?;
    for (id, input) in pending.take(limit.unwrap_or(usize::MAX)) {
        println!("{}", serde_json::json!({"id": id, "input": input}));
    }
    Ok(())
}

fn cmd_complete(db: &mut WorkDatabase, id: RecordId, output: &str) -> anyhow::Result<()> {
    let output: serde_json::Value = serde_json::from_str(output).context("output is not JSON")?;
    db.with_transaction(|db| db.update(id, output))?;
    println!("Completed: {id}");
    Ok(())
}

fn cmd_show(db: &WorkDatabase, id: RecordId) -> anyhow::Result<()> {
    let record = db.get(id)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn cmd_dedup(db: &mut WorkDatabase) -> anyhow::Result<()> {
    let removed = db.with_transaction(|db| db.remove_duplicates())?;
    let remaining = db.len()?;
    println!("Removed {removed} duplicates, {remaining} records remain.");
    Ok(())
}

fn cmd_export(db: &WorkDatabase, path: PathBuf) -> anyhow::Result<()> {
    let written = db.write_jsonl(&path)?;
    println!("Exported {written} records to {}", path.display());
    Ok(())
}
