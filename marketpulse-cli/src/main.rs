//! MarketPulse CLI — run the daily market-data pipeline or any single phase.
//!
//! Commands:
//! - `run` — FETCH → LOAD → TRANSFORM → REFRESH
//! - `fetch` / `load` / `transform` / `refresh` — one phase on its own
//! - `status` — stored datasets and their warehouse rows
//! - `history` — recent run reports
//! - `config` — print the effective configuration (secrets omitted)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use marketpulse_core::domain::InstrumentDataset;
use marketpulse_core::store::ObjectStore;
use marketpulse_runner::{
    InstrumentOutcome, PhaseStatus, Pipeline, PipelineConfig, RunHistory, RunReport,
    SqliteWarehouse, Warehouse,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "marketpulse",
    about = "MarketPulse — daily market data into object storage, warehouse and dashboards"
)]
struct Cli {
    /// Path to the TOML config file. Defaults apply when absent.
    #[arg(long, global = true, default_value = "marketpulse.toml")]
    config: PathBuf,

    /// Load environment variables from this file before reading secrets.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline.
    Run,
    /// Fetch and merge every instrument (or the given subset).
    Fetch {
        /// Only these canonical symbols.
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Seconds to pause after each provider call, overriding the config.
        #[arg(long)]
        pacing_secs: Option<u64>,
    },
    /// Upsert every stored dataset into the warehouse.
    Load,
    /// Run the transformation command.
    Transform,
    /// Trigger the dashboard refresh.
    Refresh,
    /// Report stored datasets and warehouse rows.
    Status,
    /// Show recent runs.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the effective configuration.
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("cannot load env file {}", path.display()))?;
        }
        None => {
            // a missing .env is normal
            let _ = dotenvy::dotenv();
        }
    }

    let mut config = load_config(&cli.config)?;
    config.apply_env(|name| std::env::var(name).ok());

    match cli.command {
        Commands::Run => finish(build(&config)?.run()),
        Commands::Fetch {
            symbols,
            pacing_secs,
        } => {
            if !symbols.is_empty() {
                restrict_instruments(&mut config, &symbols)?;
            }
            if let Some(secs) = pacing_secs {
                config.provider.pacing_secs = secs;
            }
            finish(build(&config)?.run_fetch())
        }
        Commands::Load => finish(build(&config)?.run_load()),
        Commands::Transform => finish(build(&config)?.run_transform()),
        Commands::Refresh => finish(build(&config)?.run_refresh()),
        Commands::Status => run_status(&config),
        Commands::History { limit } => run_history(&config, limit),
        Commands::Config => {
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    if path.exists() {
        PipelineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Ok(PipelineConfig::default())
    }
}

fn build(config: &PipelineConfig) -> Result<Pipeline> {
    Ok(config.build_pipeline()?)
}

fn restrict_instruments(config: &mut PipelineConfig, symbols: &[String]) -> Result<()> {
    let unknown: Vec<&String> = symbols
        .iter()
        .filter(|s| !config.instruments.symbols.contains(s))
        .collect();
    if !unknown.is_empty() {
        bail!("not in the instrument list: {unknown:?}");
    }
    config.instruments.symbols.retain(|s| symbols.contains(s));
    config.instruments.aliases.retain(|s, _| symbols.contains(s));
    Ok(())
}

/// Print the report; a failed run becomes a non-zero exit.
fn finish(report: RunReport) -> Result<()> {
    print_report(&report);
    match report.failure {
        Some(failure) => bail!(failure),
        None => Ok(()),
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!("=== Run {} ===", report.run_id);
    println!("Started:  {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(done) = report.finished_at {
        let secs = (done - report.started_at).num_milliseconds() as f64 / 1000.0;
        println!("Duration: {secs:.1}s");
    }
    println!();
    println!("{:<10} {:<15}", "Phase", "Status");
    println!("{}", "-".repeat(26));
    for record in &report.phases {
        let status = match record.status {
            PhaseStatus::Succeeded => "ok",
            PhaseStatus::NotConfigured => "not configured",
            PhaseStatus::Failed => "FAILED",
        };
        println!("{:<10} {:<15}", record.phase.as_str(), status);
    }

    if let Some(fetch) = &report.fetch {
        println!();
        println!("{:<8} {:<13} {:>8} {:>8} {:>8}", "Symbol", "Outcome", "Fetched", "Added", "Total");
        println!("{}", "-".repeat(49));
        for outcome in &fetch.outcomes {
            match outcome {
                InstrumentOutcome::Merged { stats } => println!(
                    "{:<8} {:<13} {:>8} {:>8} {:>8}",
                    stats.symbol, "merged", stats.fetched_days, stats.added_days, stats.total_days
                ),
                InstrumentOutcome::Skipped { symbol, reason } => {
                    println!("{symbol:<8} {:<13} {reason}", "skipped")
                }
                InstrumentOutcome::MergeFailed { symbol, error } => {
                    println!("{symbol:<8} {:<13} {error}", "merge failed")
                }
            }
        }
    }

    if let Some(load) = &report.load {
        println!();
        println!(
            "Warehouse: {} inserted, {} updated (digest {})",
            load.inserted.len(),
            load.updated.len(),
            &load.digest[..load.digest.len().min(12)]
        );
    }

    if let Some(failure) = &report.failure {
        println!();
        println!("FAILED in {}: {}", failure.phase, failure.message);
    }
}

fn run_status(config: &PipelineConfig) -> Result<()> {
    let store = config.object_store();
    let prefix = config.store.prefix.trim_matches('/');
    let keys = store.list(&format!("{prefix}/"))?;

    println!("Store: {} ({prefix}/)", store.describe());
    if keys.is_empty() {
        println!("No datasets stored yet.");
        return Ok(());
    }

    let loaded: BTreeMap<String, String> = if config.warehouse.path.exists() {
        let wh = SqliteWarehouse::open(&config.warehouse.path, &config.warehouse.table)?;
        if wh.has_table()? {
            wh.rows()?
                .into_iter()
                .map(|r| (r.symbol, r.loaded_at.format("%Y-%m-%d %H:%M").to_string()))
                .collect()
        } else {
            BTreeMap::new()
        }
    } else {
        BTreeMap::new()
    };

    println!("Datasets: {}", keys.len());
    println!();
    println!(
        "{:<8} {:<25} {:>7} {:>10}  {:<17}",
        "Symbol", "Date Range", "Days", "Size", "Loaded"
    );
    println!("{}", "-".repeat(72));
    for key in &keys {
        let Some(bytes) = store.get(key)? else {
            continue;
        };
        let size = format_size(bytes.len() as u64);
        match InstrumentDataset::from_json_slice(&bytes) {
            Ok(ds) => {
                let symbol = ds.warehouse_symbol().unwrap_or("?").to_string();
                let range = match (ds.first_date(), ds.last_date()) {
                    (Some(a), Some(b)) => format!("{a} to {b}"),
                    _ => "(empty)".into(),
                };
                let when = loaded.get(&symbol).map(String::as_str).unwrap_or("never");
                println!(
                    "{:<8} {:<25} {:>7} {:>10}  {:<17}",
                    symbol,
                    range,
                    ds.day_count(),
                    size,
                    when
                );
            }
            Err(e) => println!("{key}: unreadable ({e})"),
        }
    }
    Ok(())
}

fn run_history(config: &PipelineConfig, limit: usize) -> Result<()> {
    let history = RunHistory::new(&config.pipeline.history_path);
    let reports = history.read_recent(limit)?;
    if reports.is_empty() {
        println!("No runs recorded in {}", history.path().display());
        return Ok(());
    }

    println!("{:<17} {:<20} {:<28} {:<}", "Run", "Started", "Phases", "Result");
    println!("{}", "-".repeat(80));
    for report in &reports {
        let phases = report
            .phases_run()
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let result = match &report.failure {
            Some(f) => format!("failed in {}: {}", f.phase, truncate(&f.message, 60)),
            None => "ok".to_string(),
        };
        println!(
            "{:<17} {:<20} {:<28} {}",
            report.run_id,
            report.started_at.format("%Y-%m-%d %H:%M:%S"),
            phases,
            result
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
