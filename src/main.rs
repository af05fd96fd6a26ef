use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portfolio_scraper::replay::{ReplayBrowser, ReplayPlanner};
use portfolio_scraper::{
    Brain, Budgets, ChromeAdapter, CombinedResult, Config, ExtractionAttempt, Holding, InfluxSink,
    Orchestrator, PortfolioRecord, RetryPolicy, RunError, RunMode, RunReport, StorageSink,
    StorageStatus,
};

const EXIT_EXHAUSTED: u8 = 1;
const EXIT_SESSION_UNAVAILABLE: u8 = 2;
const EXIT_CONFIG: u8 = 3;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "portfolio-scraper", version, about = "Portfolio Scraper")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,

    /// Set the logging level (RUST_LOG takes precedence)
    #[arg(long, value_enum, ignore_case = true, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch portfolio data from the dashboard (default)
    Run(RunArgs),
    /// Re-drive a dumped attempt history and check the answers reproduce
    Replay { path: PathBuf },
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Type of data to fetch
    #[arg(long, value_enum, default_value_t = RunMode::Both)]
    data_type: RunMode,

    /// Do not store data in InfluxDB
    #[arg(long)]
    no_influxdb: bool,

    /// Write every extraction attempt as JSON to this file
    #[arg(long, value_name = "PATH")]
    dump_history: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    #[value(alias = "warning")]
    Warn,
    #[value(alias = "critical")]
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(level)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    let outcome = match cli.command {
        Some(Command::Replay { path }) => replay(&path).await,
        Some(Command::Run(args)) => run(args).await,
        None => run(cli.run).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("Error in portfolio scraper: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: LogLevel) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => return Ok(ExitCode::from(config_failure("Configuration error", &e))),
    };

    let browser = Arc::new(ChromeAdapter::new(config.chrome.clone()));
    let brain = match Brain::new(config.provider.clone()) {
        Ok(brain) => brain,
        Err(e) => return Ok(ExitCode::from(config_failure("Failed to build LLM client", &e))),
    };
    info!(provider = %brain.provider(), model = %config.provider.model, "LLM ready");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(browser, Arc::new(brain), &config.portfolio_url)
        .with_budgets(config.budgets)
        .with_retry_policy(config.retry.clone())
        .with_series(&config.series)
        .with_cancellation(cancel);
    if let Some(sink) = storage_sink(&config, args.no_influxdb) {
        orchestrator = orchestrator.with_sink(sink);
    }

    let outcome = orchestrator.run(args.data_type).await;
    let code = finish_run(
        outcome,
        args.dump_history.as_deref(),
        &orchestrator.recorded_attempts(),
    );
    Ok(ExitCode::from(code))
}

/// Report the outcome, then write the history dump. A failed dump is logged
/// and never changes the exit code.
fn finish_run(
    outcome: Result<RunReport, RunError>,
    dump: Option<&Path>,
    attempts: &[ExtractionAttempt],
) -> u8 {
    let code = report_outcome(outcome);
    if let Some(path) = dump {
        if let Err(e) = dump_history(path, attempts) {
            error!("History dump failed: {:#}", e);
        }
    }
    code
}

fn report_outcome(outcome: Result<RunReport, RunError>) -> u8 {
    match outcome {
        Ok(report) => {
            info!("Portfolio data fetched successfully");
            print_result(&report.result);
            match &report.storage {
                StorageStatus::Written => info!("Portfolio data written to InfluxDB"),
                StorageStatus::Failed { error } => {
                    warn!("Failed to write portfolio data to InfluxDB: {}", error)
                }
                StorageStatus::Disabled => {}
            }
            0
        }
        Err(e) => {
            error!(error_kind = e.kind(), "{}", e);
            match e {
                RunError::Exhausted { .. } => EXIT_EXHAUSTED,
                RunError::SessionUnavailable { .. } => EXIT_SESSION_UNAVAILABLE,
                RunError::Cancelled { .. } => EXIT_CANCELLED,
            }
        }
    }
}

fn config_failure(what: &str, e: &dyn fmt::Display) -> u8 {
    error!(error_kind = "config", "{}: {}", what, e);
    EXIT_CONFIG
}

fn storage_sink(config: &Config, disabled: bool) -> Option<Arc<dyn StorageSink>> {
    if disabled {
        info!("InfluxDB storage disabled by flag");
        return None;
    }
    let Some(influx) = &config.influx else {
        warn!("InfluxDB client not initialized, skipping data storage");
        return None;
    };
    match InfluxSink::new(influx) {
        Ok(sink) => Some(Arc::new(sink)),
        Err(e) => {
            warn!("Failed to initialize InfluxDB client: {}", e);
            None
        }
    }
}

fn dump_history(path: &Path, attempts: &[ExtractionAttempt]) -> Result<()> {
    let json = serde_json::to_string_pretty(attempts)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write history to {}", path.display()))?;
    info!(attempts = attempts.len(), path = %path.display(), "History written");
    Ok(())
}

async fn replay(path: &Path) -> Result<ExitCode> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read history from {}", path.display()))?;
    let recorded: Vec<ExtractionAttempt> =
        serde_json::from_str(&raw).context("history file is not an attempt dump")?;

    let mut diverged = 0;
    for attempt in &recorded {
        let steps = attempt.history.len().max(1);
        let orchestrator = Orchestrator::new(
            Arc::new(ReplayBrowser::new(attempt)),
            Arc::new(ReplayPlanner::new(attempt)),
            "replay://portfolio",
        )
        .with_budgets(Budgets {
            raw_steps: steps,
            structured_steps: steps,
            time_budget: Duration::from_secs(300),
        })
        .with_retry_policy(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });

        // The outcome is compared through the recorded attempts below.
        let _ = orchestrator.run(attempt.kind.into()).await;
        let replayed = orchestrator.recorded_attempts();
        let answer = replayed.first().and_then(|a| a.final_answer());

        if answer == attempt.final_answer() {
            println!("{} attempt {}: reproduced", attempt.kind, attempt.index);
        } else {
            diverged += 1;
            println!("{} attempt {}: diverged", attempt.kind, attempt.index);
        }
    }

    info!(attempts = recorded.len(), diverged, "Replay finished");
    Ok(if diverged == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_result(result: &CombinedResult) {
    let rule = "=".repeat(80);
    println!("\n{rule}\n");
    match (&result.raw, &result.structured) {
        (Some(raw), Some(record)) => {
            println!("=== RAW PORTFOLIO DATA ===");
            println!("{}", raw.text);
            println!("\n=== STRUCTURED PORTFOLIO DATA ===");
            print_record(record);
        }
        (Some(raw), None) => println!("{}", raw.text),
        (None, Some(record)) => print_record(record),
        (None, None) => {}
    }
    println!("\n{rule}\n");
}

fn print_record(record: &PortfolioRecord) {
    match (record.net_worth, record.sol_equivalent) {
        (Some(usd), Some(sol)) => println!("Net Worth: ${usd:.2} (SOL: {sol:.2})"),
        (Some(usd), None) => println!("Net Worth: ${usd:.2}"),
        (None, _) => println!("Net Worth: not shown"),
    }
    println!("\nTop 5 Holdings:");
    for asset in &record.top_assets {
        print_holding(asset);
    }
    println!("\nTop 5 Platforms:");
    for platform in &record.top_platforms {
        print_holding(platform);
    }
}

fn print_holding(holding: &Holding) {
    match holding.percentage {
        Some(pct) => println!("- {}: ${:.2} ({:.2}%)", holding.name, holding.value, pct),
        None => println!("- {}: ${:.2}", holding.name, holding.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portfolio_scraper::{PlanningError, RawResult};

    fn report() -> RunReport {
        RunReport {
            mode: RunMode::Raw,
            result: CombinedResult {
                raw: RawResult::new("# Portfolio\nNet Worth: $10"),
                structured: None,
            },
            failures: Vec::new(),
            attempts: Vec::new(),
            storage: StorageStatus::Disabled,
        }
    }

    #[test]
    fn unwritable_history_dump_keeps_a_successful_exit() {
        let path = std::env::temp_dir()
            .join("portfolio-scraper-no-such-dir")
            .join("history.json");
        assert_eq!(finish_run(Ok(report()), Some(&path), &[]), 0);
    }

    #[test]
    fn history_dump_is_written_after_a_failed_run() {
        let path = std::env::temp_dir()
            .join(format!("portfolio-history-{}.json", std::process::id()));
        let exhausted = RunError::Exhausted {
            failures: Vec::new(),
        };
        let code = finish_run(Err(exhausted), Some(&path), &[]);
        assert_eq!(code, EXIT_EXHAUSTED);
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "[]");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn llm_client_failures_exit_as_configuration_errors() {
        let err = PlanningError::Permanent("http client: no TLS backend".into());
        let code = config_failure("Failed to build LLM client", &err);
        assert_eq!(code, EXIT_CONFIG);
        assert_ne!(code, EXIT_EXHAUSTED);
    }
}
