use std::collections::HashSet;
use std::sync::Arc;

use analysis_core::{
    InvestmentHorizon, InvestmentObjective, MarketDataProvider, RiskTolerance, UserProfile,
};
use analysis_orchestrator::{
    AnalysisOutcome, AnalysisReport, EventStream, LoadingStage, Orchestrator, OrchestratorEvent,
    ProgressState, RequestId, CANCELLED_MESSAGE, CANCELLED_SUGGESTION,
};
use anyhow::Result;
use clap::Parser;
use polygon_client::{DemoDataset, PolygonClient};
use tokio::sync::watch;
use tokio::task::JoinHandle;

mod config;
mod scoring;

use config::AppConfig;
use scoring::ProfileScorer;

const DEFAULT_LOG_LEVEL: &str = "info";

fn default_log_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(DEFAULT_LOG_LEVEL)
}

#[derive(Parser)]
#[command(
    name = "analyze",
    about = "Profile-aware stock analysis with caching, retries and a single-flight queue"
)]
struct Cli {
    /// Tickers to analyze, in submission order (e.g. AAPL MSFT NVDA).
    #[arg(required = true)]
    tickers: Vec<String>,

    /// Risk tolerance: conservative, moderate, aggressive.
    #[arg(long, default_value = "moderate")]
    risk: RiskTolerance,

    /// Investment horizon: short, medium, long.
    #[arg(long, default_value = "medium")]
    horizon: InvestmentHorizon,

    /// Investment objective: income, balanced, growth.
    #[arg(long, default_value = "balanced")]
    objective: InvestmentObjective,

    /// Use the offline demo dataset even when POLYGON_API_KEY is set.
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Submit the batch this many times. Later rounds are answered from cache.
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Print finished reports as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_log_filter()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_log_filter()),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    let cli = Cli::parse();
    let config = AppConfig::from_env(cli.demo)?;

    let provider: Arc<dyn MarketDataProvider> = match &config.polygon_api_key {
        Some(key) => Arc::new(PolygonClient::new(key.clone())),
        None => {
            tracing::info!("No POLYGON_API_KEY configured, using the demo dataset");
            Arc::new(DemoDataset::new())
        }
    };
    let source = provider.provider_name();

    let (orchestrator, mut events) =
        Orchestrator::spawn(provider, Arc::new(ProfileScorer::new()), config.orchestrator.clone());
    let progress_printer = spawn_progress_printer(orchestrator.progress());

    let profile = UserProfile::new(cli.risk, cli.horizon, cli.objective);
    println!(
        "Analyzing {} ticker(s) for a {} / {} / {} profile using {} data",
        cli.tickers.len(),
        profile.risk_tolerance.as_str(),
        profile.horizon.as_str(),
        profile.objective.as_str(),
        source
    );

    let mut tally = Tally::default();
    for round in 1..=cli.repeat.max(1) {
        if cli.repeat > 1 {
            println!("\n== Round {} of {} ==", round, cli.repeat);
        }

        let pending: HashSet<RequestId> = cli
            .tickers
            .iter()
            .map(|ticker| orchestrator.submit(ticker, profile))
            .collect();

        let interrupted = run_round(&orchestrator, &mut events, pending, cli.json, &mut tally).await?;
        if interrupted {
            break;
        }
    }

    progress_printer.abort();
    println!(
        "\nDone: {} completed ({} from cache), {} failed, {} cancelled",
        tally.completed, tally.cached, tally.failed, tally.cancelled
    );
    Ok(())
}

#[derive(Default)]
struct Tally {
    completed: usize,
    cached: usize,
    failed: usize,
    cancelled: usize,
}

/// Print events until every id in `pending` has finished. Returns whether Ctrl-C was pressed.
async fn run_round(
    orchestrator: &Orchestrator,
    events: &mut EventStream,
    mut pending: HashSet<RequestId>,
    json: bool,
    tally: &mut Tally,
) -> Result<bool> {
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !pending.is_empty() {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                tracing::info!("Received SIGINT");
                eprintln!("Cancelling current analysis and clearing the queue...");
                orchestrator.cancel();
                interrupted = true;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("orchestrator stopped with {} request(s) outstanding", pending.len());
                };
                if let OrchestratorEvent::Finished { request_id, .. } = &event {
                    pending.remove(request_id);
                }
                render_event(event, json, tally)?;
            }
        }
    }

    Ok(interrupted)
}

fn render_event(event: OrchestratorEvent, json: bool, tally: &mut Tally) -> Result<()> {
    match event {
        OrchestratorEvent::CacheHit { ticker, notice, .. } => {
            eprintln!("{}: {}", ticker, notice);
        }
        OrchestratorEvent::Queued { ticker, position, queue_len, .. } => {
            eprintln!("{}: queued ({} of {})", ticker, position, queue_len);
        }
        OrchestratorEvent::Started { ticker, .. } => {
            eprintln!("{}: started", ticker);
        }
        OrchestratorEvent::Idle => {
            tracing::debug!("Orchestrator idle");
        }
        OrchestratorEvent::Finished { ticker, outcome, .. } => match outcome {
            AnalysisOutcome::Completed(report) => {
                tally.completed += 1;
                if report.from_cache {
                    tally.cached += 1;
                }
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_report(&report);
                }
            }
            AnalysisOutcome::Failed(err) => {
                tally.failed += 1;
                let label = if ticker.is_empty() { "(blank)" } else { ticker.as_str() };
                println!("\n{}  [{}] {}", label, err.category, err.message);
                println!("  Suggestion: {}", err.suggestion);
            }
            AnalysisOutcome::Cancelled => {
                tally.cancelled += 1;
                println!("\n{}  {}", ticker, CANCELLED_MESSAGE);
                println!("  {}", CANCELLED_SUGGESTION);
            }
        },
    }
    Ok(())
}

fn print_report(report: &AnalysisReport) {
    let snapshot = &report.snapshot;
    let analysis = &report.analysis;

    let change = snapshot
        .change_percent
        .map(|c| format!(" ({:+.2}%)", c))
        .unwrap_or_default();
    println!(
        "\n{}  {}  ${:.2}{}",
        report.ticker,
        snapshot.name.as_deref().unwrap_or(""),
        snapshot.price,
        change
    );
    println!(
        "  Signal: {} (confidence {:.0}%)",
        analysis.signal.to_label(),
        analysis.confidence * 100.0
    );
    println!("  {}", analysis.reason);

    match (&report.history, &report.history_error) {
        (Some(history), _) => {
            let returns: Vec<String> = history
                .iter()
                .map(|(period, series)| match series.total_return() {
                    Some(r) => format!("{} {:+.1}%", period, r),
                    None => format!("{} n/a", period),
                })
                .collect();
            println!("  History: {}", returns.join(" | "));
        }
        (None, Some(err)) => println!("  History unavailable: {}", err.message),
        (None, None) => {}
    }

    if let Some(notice) = &report.notice {
        println!("  {}", notice);
    }
}

fn spawn_progress_printer(mut progress: watch::Receiver<ProgressState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let state = *progress.borrow_and_update();
            if state.stage == LoadingStage::Idle {
                continue;
            }
            eprintln!(
                "  [{:>3}%] {}: {}",
                state.percent,
                state.stage.label(),
                state.stage.helper_text()
            );
        }
    })
}
