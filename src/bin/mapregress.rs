//! mapregress CLI - regression test runner for WMS/WFS servers.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use mapregress::{
    CaseStore, DirectorySink, HttpFetcher, MemorySink, OutcomeReport, OutcomeStatus,
    ResultSink, RunFilter, RunReport, RunnerConfig, SuiteLoader, TestRunner,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Re-run stored map requests and compare them with their baselines.
#[derive(Parser, Debug)]
#[command(name = "mapregress", version, about)]
struct Cli {
    /// Suite file or directory of suite files.
    #[arg(short = 'p', long = "path", default_value = "suites")]
    suite_path: PathBuf,

    /// Runner config file (YAML).
    #[arg(short = 'c', long = "config", env = "MAPREGRESS_CONFIG")]
    config: Option<PathBuf>,

    /// Server prefix the requests are appended to.
    #[arg(short = 's', long = "server", env = "MAPREGRESS_SERVER")]
    server: Option<String>,

    /// Only run cases whose name contains this text.
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Only run cases of this category.
    #[arg(long = "category")]
    category: Option<u64>,

    /// Number of concurrent comparisons.
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Per-channel tolerance before a difference counts as big.
    #[arg(long = "tolerance")]
    tolerance: Option<u8>,

    /// Request timeout in seconds.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Write response, diff and overlay images plus the report here.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Free-text description stored with the run.
    #[arg(short = 'd', long = "description", default_value = "")]
    description: String,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn prepare_config(args: &Cli) -> Result<RunnerConfig> {
    let mut config = match &args.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };
    if let Some(server) = &args.server {
        config.server_prefix = server.clone();
    }
    if let Some(workers) = args.workers {
        config.worker_pool_size = workers;
    }
    if let Some(tolerance) = args.tolerance {
        config.diff.tolerance = tolerance;
    }
    if let Some(timeout) = args.timeout {
        config.request_timeout = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn print_outcome(outcome: &OutcomeReport) {
    let color = match outcome.status {
        OutcomeStatus::Success => 32,
        OutcomeStatus::Warning => 33,
        _ => 31,
    };
    info!(
        "\x1b[{}m{:<7}\x1b[0m {} ({} invalid, {} big, {} ms)",
        color,
        outcome.status.to_string(),
        outcome.case_name,
        outcome.invalid_pixel_count,
        outcome.big_diff_pixel_count,
        outcome.duration_ms
    );
    if let Some(err) = &outcome.error {
        error!("     \x1b[31mError: {}\x1b[0m", err);
    }
}

fn render_text(report: &RunReport) -> String {
    let mut content = String::new();
    content.push_str(&format!("Run {}: {}\n", report.run.id, report.run.description));
    content.push_str(&format!("Server: {}\n", report.run.server_prefix));
    content.push_str(&format!("Started: {}\n\n", report.run.started_at.to_rfc3339()));
    for outcome in &report.outcomes {
        content.push_str(&format!(
            "  [{}] {} ({})\n",
            outcome.status, outcome.case_name, outcome.case_id
        ));
        content.push_str(&format!(
            "     Pixels: {} invalid, {} big\n",
            outcome.invalid_pixel_count, outcome.big_diff_pixel_count
        ));
        if let Some(err) = &outcome.error {
            content.push_str(&format!("     Error: {err}\n"));
        }
    }
    let s = &report.summary;
    content.push_str(&format!(
        "\nTotal: {}  Success: {}  Warning: {}  Failed: {}  Error: {}  Not run: {}\n",
        s.total, s.success, s.warning, s.failed, s.error, s.not_run
    ));
    content.push_str(&format!("Duration: {} ms\n", s.duration_ms));
    content
}

fn save_report(report: &RunReport, dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let (filename, content) = match format {
        ReportFormat::Json => ("report.json", serde_json::to_string_pretty(report)?),
        ReportFormat::Yaml => ("report.yaml", serde_yaml::to_string(report)?),
        ReportFormat::Text => ("report.txt", render_text(report)),
    };
    let path = dir.join(filename);
    fs::write(&path, content).context(format!("Failed to write report: {}", path.display()))?;
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let config = prepare_config(&args)?;

    let mut loader = SuiteLoader::new();
    loader.add_path(&args.suite_path);
    let filter = RunFilter {
        name: args.filter.clone(),
        category_id: args.category,
    };
    let cases = loader.list_eligible_cases(&filter)?;
    if cases.is_empty() {
        return Err(anyhow!("No eligible test cases found"));
    }

    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(config.request_timeout)));
    let memory = Arc::new(MemorySink::new());
    let directory = args
        .report_dir
        .as_ref()
        .map(|dir| Arc::new(DirectorySink::new(dir, config.diff)));
    let sink: Arc<dyn ResultSink> = match &directory {
        Some(dir) => dir.clone(),
        None => memory.clone(),
    };

    let runner = TestRunner::new(&config, fetcher, sink);
    let cancel = CancellationToken::new();
    let handle = runner.start_run(&args.description, cases, cancel.clone());

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight comparisons");
            ctrl_c.cancel();
        }
    });

    let summary = match handle.join().await {
        Ok(summary) => summary,
        Err(err) => {
            error!("\x1b[31m{}\x1b[0m", err);
            exit(2);
        }
    };

    let outcomes = match &directory {
        Some(dir) => dir.reports(),
        None => memory.reports(),
    };
    for outcome in &outcomes {
        print_outcome(outcome);
    }

    info!("Summary:");
    info!("  Total: {}", summary.total);
    info!("  \x1b[32mSuccess: {}\x1b[0m", summary.success);
    info!("  \x1b[33mWarning: {}\x1b[0m", summary.warning);
    info!("  \x1b[31mFailed: {}\x1b[0m", summary.failed);
    info!("  \x1b[31mError: {}\x1b[0m", summary.error);
    info!("  Not run: {}", summary.not_run);
    info!("  Duration: {} ms", summary.duration_ms);

    if let (Some(dir), Some(run)) = (&directory, &summary.run) {
        let report = RunReport {
            run: run.clone(),
            outcomes,
            summary: summary.clone(),
        };
        let target = dir.run_dir().unwrap_or_else(|| PathBuf::from("."));
        match save_report(&report, &target, args.report_format) {
            Ok(path) => info!("Report saved: {}", path.display()),
            Err(e) => error!("Failed to save report: {}", e),
        }
    }

    if !summary.all_passed() {
        exit(1);
    }
    Ok(())
}
