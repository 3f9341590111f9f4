//! Rollup CLI - Command-line interface for Synheart Rollup
//!
//! Commands:
//! - ingest: Append an Apple Health export or NDJSON candidates to the sample log
//! - validate: Check an Apple Health export without storing anything
//! - rollup: Print hourly or daily buckets for one metric
//! - snapshot: Print a comprehensive snapshot
//! - sync: Refresh the durable client cache and print the cache entry

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::env;
use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use synheart_rollup::schema::AppleHealthAdapter;
use synheart_rollup::store::SampleStore;
use synheart_rollup::types::Granularity;
use synheart_rollup::{
    AggregationEngine, CacheError, Deduplicator, DurableStore, LocalSource, MetricType,
    RollupConfig, RollupError, SnapshotAssembler, SqliteSampleStore, SyncCache, ROLLUP_VERSION,
};

/// Rollup - Wearable metric rollups and snapshot sync
#[derive(Parser)]
#[command(name = "rollup")]
#[command(author = "Synheart AI Inc")]
#[command(version = ROLLUP_VERSION)]
#[command(about = "Ingest wearable data and serve consistent snapshots", long_about = None)]
struct Cli {
    /// SQLite database (overrides ROLLUP_DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append readings to the sample log
    Ingest {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "apple-health")]
        input_format: InputFormat,

        /// Patient the readings belong to (defaults to the export's userId)
        #[arg(long)]
        patient: Option<String>,

        /// Device the readings came from (defaults to the export's deviceId)
        #[arg(long)]
        device: Option<String>,
    },

    /// Check an Apple Health export and report what ingestion would store
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Print rollup buckets for one metric
    Rollup {
        #[arg(long)]
        patient: String,

        /// Metric type (e.g. steps, heart_rate)
        #[arg(long)]
        metric: String,

        #[arg(long, default_value = "day")]
        granularity: BucketWidth,

        /// Days of history to cover
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Print a comprehensive snapshot
    Snapshot {
        #[arg(long)]
        patient: String,

        /// Days of daily history (defaults to ROLLUP_DEFAULT_DAYS)
        #[arg(long)]
        days: Option<u32>,

        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Refresh the durable client cache and print the resulting entry
    Sync {
        #[arg(long)]
        patient: String,

        #[arg(long)]
        days: Option<u32>,

        /// Cache directory (overrides ROLLUP_CACHE_DIR)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Apple Health export document
    AppleHealth,
    /// Newline-delimited JSON (one sample candidate per line)
    Ndjson,
}

#[derive(Clone, ValueEnum)]
enum BucketWidth {
    Hour,
    Day,
}

impl From<BucketWidth> for Granularity {
    fn from(width: BucketWidth) -> Self {
        match width {
            BucketWidth::Hour => Granularity::Hour,
            BucketWidth::Day => Granularity::Day,
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr so stdout stays machine-readable.
/// - Level from `RUST_LOG`, otherwise `ROLLUP_LOG_LEVEL` (default: warn)
/// - `FORCE_COLOR=1|true|yes` forces colors on, `0|false|no` off,
///   anything else auto-detects a terminal on stderr
fn init_tracing() {
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => io::stderr().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("ROLLUP_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(level)
    };

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(true)
        .with_ansi(use_color)
        .with_env_filter(env_filter)
        .init();
}

fn run(cli: Cli) -> Result<(), RollupCliError> {
    let mut config = RollupConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    config.log_config();

    match cli.command {
        Commands::Ingest {
            input,
            input_format,
            patient,
            device,
        } => cmd_ingest(&config, &input, input_format, patient, device),
        Commands::Validate { input } => cmd_validate(&input),
        Commands::Rollup {
            patient,
            metric,
            granularity,
            days,
        } => cmd_rollup(&config, &patient, &metric, granularity.into(), days),
        Commands::Snapshot {
            patient,
            days,
            pretty,
        } => {
            let days = days.unwrap_or(config.default_days);
            cmd_snapshot(&config, &patient, days, pretty)
        }
        Commands::Sync {
            patient,
            days,
            cache_dir,
        } => {
            let days = days.unwrap_or(config.default_days);
            if let Some(dir) = cache_dir {
                config.cache_dir = dir;
            }
            cmd_sync(&config, &patient, days)
        }
    }
}

fn read_input(input: &Path) -> Result<String, RollupCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn open_store(config: &RollupConfig) -> Result<Arc<SqliteSampleStore>, RollupCliError> {
    Ok(Arc::new(SqliteSampleStore::open(&config.database_path)?))
}

fn cmd_ingest(
    config: &RollupConfig,
    input: &Path,
    input_format: InputFormat,
    patient: Option<String>,
    device: Option<String>,
) -> Result<(), RollupCliError> {
    let data = read_input(input)?;

    let (patient, device, candidates, report) = match input_format {
        InputFormat::AppleHealth => {
            let export = AppleHealthAdapter::parse(&data)?;
            let report = AppleHealthAdapter::to_candidates(&export);
            let patient = patient
                .or_else(|| export.user_id.clone())
                .ok_or(RollupCliError::MissingPatient)?;
            let device = device.unwrap_or_else(|| export.device_id.clone());
            let candidates = report.candidates.clone();
            (patient, device, candidates, Some(report))
        }
        InputFormat::Ndjson => {
            let candidates = AppleHealthAdapter::parse_candidates_ndjson(&data)?;
            let patient = patient.ok_or(RollupCliError::MissingPatient)?;
            let device = device.ok_or(RollupCliError::MissingDevice)?;
            (patient, device, candidates, None)
        }
    };

    if candidates.is_empty() {
        return Err(RollupCliError::NoSamples);
    }

    let store = open_store(config)?;
    let result = Deduplicator::new(store).ingest(&patient, &device, candidates);

    let output = serde_json::json!({
        "patient_id": patient,
        "device_id": device,
        "result": result,
        "skipped_unknown": report.as_ref().map(|r| r.skipped_unknown),
        "conversion_issues": report.as_ref().map(|r| r.issues.len()),
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn cmd_validate(input: &Path) -> Result<(), RollupCliError> {
    let data = read_input(input)?;
    let export = AppleHealthAdapter::parse(&data)?;
    let report = AppleHealthAdapter::to_candidates(&export);
    let devices = AppleHealthAdapter::extract_device_info(&export);

    let output = serde_json::json!({
        "records": export.metrics.len(),
        "convertible": report.candidates.len(),
        "by_metric": report.counts(),
        "skipped_unknown": report.skipped_unknown,
        "unknown_types": report.unknown_types,
        "skipped_empty": report.skipped_empty,
        "issues": report.issues,
        "device": devices,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if report.issues.is_empty() {
        Ok(())
    } else {
        Err(RollupCliError::ValidationFailed(report.issues.len()))
    }
}

fn cmd_rollup(
    config: &RollupConfig,
    patient: &str,
    metric: &str,
    granularity: Granularity,
    days: u32,
) -> Result<(), RollupCliError> {
    let metric: MetricType = metric.parse()?;
    let (start, end) = rollup_range(Utc::now(), granularity, days, config.max_days)?;
    let store = open_store(config)?;
    let view = store.read_view(patient, start, end)?;

    let engine = AggregationEngine::from_config(config);
    let buckets = engine.rollup(&view.samples, metric, start, end, granularity)?;
    println!("{}", serde_json::to_string(&buckets)?);
    Ok(())
}

/// `days` UTC days ending with the current `granularity` bucket
fn rollup_range(
    now: DateTime<Utc>,
    granularity: Granularity,
    days: u32,
    max_days: u32,
) -> Result<(DateTime<Utc>, DateTime<Utc>), RollupError> {
    if days == 0 || days > max_days {
        return Err(RollupError::InvalidDays {
            requested: days,
            max: max_days,
        });
    }
    let out_of_range = || RollupError::InvalidWindow(format!("{days} days before {now} is out of range"));
    let end = granularity
        .floor(now)
        .checked_add_signed(granularity.step())
        .ok_or_else(out_of_range)?;
    let start = Granularity::Day
        .floor(now)
        .checked_sub_signed(Duration::days(i64::from(days) - 1))
        .ok_or_else(out_of_range)?;
    Ok((start, end))
}

fn cmd_snapshot(
    config: &RollupConfig,
    patient: &str,
    days: u32,
    pretty: bool,
) -> Result<(), RollupCliError> {
    let store = open_store(config)?;
    let assembler = SnapshotAssembler::new(store, config.clone());
    let snapshot = assembler.get_comprehensive_snapshot(patient, days)?;

    let json = if pretty {
        serde_json::to_string_pretty(&snapshot)?
    } else {
        serde_json::to_string(&snapshot)?
    };
    println!("{json}");
    Ok(())
}

fn cmd_sync(config: &RollupConfig, patient: &str, days: u32) -> Result<(), RollupCliError> {
    let store = open_store(config)?;
    let assembler = Arc::new(SnapshotAssembler::new(store, config.clone()));
    let source = Arc::new(LocalSource::new(assembler));
    let durable = DurableStore::new(config.cache_dir.clone(), &format!("comprehensive-{patient}"));
    let cache = SyncCache::new(source, Some(durable), patient, days);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let entry = runtime.block_on(async {
        cache.load_durable().await?;
        let entry = cache.refresh().await?;
        cache.flush().await?;
        Ok::<_, CacheError>(entry)
    })?;

    let output = serde_json::json!({
        "state": entry.state,
        "generation_id": entry.generation_id(),
        "last_synced_at": entry.last_synced_at().map(|t| t.to_rfc3339()),
        "last_error": entry.last_error,
        "cards": entry.cards,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

// Error types

#[derive(Debug)]
enum RollupCliError {
    Io(io::Error),
    Rollup(RollupError),
    Cache(CacheError),
    Json(serde_json::Error),
    MissingPatient,
    MissingDevice,
    NoSamples,
    ValidationFailed(usize),
}

impl From<io::Error> for RollupCliError {
    fn from(e: io::Error) -> Self {
        RollupCliError::Io(e)
    }
}

impl From<RollupError> for RollupCliError {
    fn from(e: RollupError) -> Self {
        RollupCliError::Rollup(e)
    }
}

impl From<CacheError> for RollupCliError {
    fn from(e: CacheError) -> Self {
        RollupCliError::Cache(e)
    }
}

impl From<serde_json::Error> for RollupCliError {
    fn from(e: serde_json::Error) -> Self {
        RollupCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<RollupCliError> for CliError {
    fn from(e: RollupCliError) -> Self {
        match e {
            RollupCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            RollupCliError::Rollup(e) => {
                let (code, hint) = match &e {
                    RollupError::Storage(_) => ("STORAGE_ERROR", "Check ROLLUP_DATABASE_PATH"),
                    RollupError::Config(_) => ("CONFIG_ERROR", "Check ROLLUP_* environment variables"),
                    RollupError::InvalidDays { .. } => ("INVALID_DAYS", "Choose --days within ROLLUP_MAX_DAYS"),
                    RollupError::InvalidWindow(_) => ("INVALID_WINDOW", "Choose a shorter --days window"),
                    RollupError::UnknownMetricType(_) => {
                        ("UNKNOWN_METRIC", "Use a snake_case metric name such as steps or heart_rate")
                    }
                    RollupError::ParseError(_) | RollupError::JsonError(_) => {
                        ("PARSE_ERROR", "Ensure input is an Apple Health export or sample NDJSON")
                    }
                    _ => ("ROLLUP_ERROR", "Re-run with ROLLUP_LOG_LEVEL=debug for details"),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            RollupCliError::Cache(e) => CliError {
                code: "CACHE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check ROLLUP_CACHE_DIR and the sample database".to_string()),
            },
            RollupCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            RollupCliError::MissingPatient => CliError {
                code: "MISSING_PATIENT".to_string(),
                message: "No patient id given and the input carries none".to_string(),
                hint: Some("Pass --patient".to_string()),
            },
            RollupCliError::MissingDevice => CliError {
                code: "MISSING_DEVICE".to_string(),
                message: "No device id given".to_string(),
                hint: Some("Pass --device".to_string()),
            },
            RollupCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No samples found in input".to_string(),
                hint: Some("Check that the input contains supported metric types".to_string()),
            },
            RollupCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{count} records could not be converted"),
                hint: Some("See the issues list for details".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rollup_range_covers_requested_days() {
        let now = Utc.with_ymd_and_hms(2025, 11, 12, 10, 20, 0).unwrap();
        let (start, end) = rollup_range(now, Granularity::Hour, 7, 90).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 11, 6, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 11, 12, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_rollup_range_rejects_bad_days() {
        let now = Utc.with_ymd_and_hms(2025, 11, 12, 10, 20, 0).unwrap();
        assert!(matches!(
            rollup_range(now, Granularity::Day, 0, 90),
            Err(RollupError::InvalidDays { requested: 0, max: 90 })
        ));
        assert!(matches!(
            rollup_range(now, Granularity::Day, 200_000_000, 90),
            Err(RollupError::InvalidDays { .. })
        ));
        assert!(matches!(
            rollup_range(now, Granularity::Day, u32::MAX, u32::MAX),
            Err(RollupError::InvalidWindow(_))
        ));
    }
}
