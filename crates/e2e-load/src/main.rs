use anyhow::{Context, Result};
use clap::Parser;
use e2e_core::{
    result_rows, run_sweep, sweep_paths, write_buckets, write_cdf, write_json, write_results,
    write_summaries, Config, ConfirmationStore, Dispatcher, HttpDispatcher, MemoryStore,
    MockDispatcher, PgStore, RunArtifacts, RunContext, RunReport, RunSummary, SweepSummary,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "e2e-load")]
#[command(about = "Paced load against an endpoint with store-side confirmation and e2e latency")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Submission mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Target requests per second (overrides config)
    #[arg(long)]
    rate: Option<f64>,

    /// Fire phase duration in seconds (overrides config)
    #[arg(long)]
    duration: Option<f64>,

    /// Comma-separated rates for a sweep (overrides config)
    #[arg(long, value_delimiter = ',')]
    sweep: Vec<f64>,

    /// Output directory (overrides config)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Print progress every N milliseconds (0 disables)
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,

    /// Mock endpoint latency in milliseconds
    #[arg(long, default_value = "5")]
    mock_latency_ms: u64,

    /// Delay before a mock request becomes visible in the mock store
    #[arg(long, default_value = "50")]
    mock_persist_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    apply_overrides(&mut config, &args);

    let http = match args.mode.as_str() {
        "mock" => false,
        "http" => true,
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };
    config.validate(http).context("Invalid configuration")?;

    info!("Starting e2e load in {} mode", args.mode);
    info!("Targets: {:?}", config.target.urls);
    info!("Rates: {:?} req/s for {}s", config.rates(), config.run.duration_s);

    let (dispatcher, store): (Arc<dyn Dispatcher>, Arc<dyn ConfirmationStore>) = if http {
        let dispatcher =
            HttpDispatcher::new(&config.target).context("Failed to create HTTP dispatcher")?;
        let store = PgStore::connect(&config.store).await?;
        (Arc::new(dispatcher), Arc::new(store))
    } else {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = MockDispatcher::new(Duration::from_millis(args.mock_latency_ms))
            .persisting_into(store.clone(), Duration::from_millis(args.mock_persist_ms));
        (Arc::new(dispatcher), store)
    };
    info!(
        "Using dispatcher: {}, store: {}",
        dispatcher.name(),
        store.name()
    );

    let cancel = CancellationToken::new();
    spawn_interrupt_listener(cancel.clone());

    let rates = config.rates();
    let sweep_mode = !config.run.sweep_rates.is_empty();
    let out_dir = PathBuf::from(&config.output.dir);
    let prefix = config.output.prefix.clone();

    let ctx = RunContext {
        config,
        dispatcher,
        store,
        cancel,
        progress_every: (args.print_every_ms > 0)
            .then(|| Duration::from_millis(args.print_every_ms)),
    };

    let sweep = run_sweep(&ctx, &rates).await?;

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();

    for (idx, run) in sweep.runs.iter().enumerate() {
        let point = sweep_mode.then_some(idx + 1);
        write_run(&out_dir, &prefix, point, &stamp, run)?;
        print_summary(run.summary(), run.aborted);
    }
    if sweep_mode {
        write_sweep(&out_dir, &prefix, &stamp, &sweep.summary)?;
        print_sweep(&sweep.summary);
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(rate) = args.rate {
        config.run.rate = rate;
    }
    if let Some(duration) = args.duration {
        config.run.duration_s = duration;
    }
    if !args.sweep.is_empty() {
        config.run.sweep_rates = args.sweep.clone();
    }
    if let Some(dir) = &args.out_dir {
        config.output.dir = dir.to_string_lossy().to_string();
    }
}

fn spawn_interrupt_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted; stopping new requests and finalizing...");
                cancel.cancel();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });
}

fn write_run(
    dir: &Path,
    prefix: &str,
    point: Option<usize>,
    stamp: &str,
    run: &RunReport,
) -> Result<()> {
    let paths = RunArtifacts::new(dir, prefix, point, run.rate, stamp);

    write_results(&paths.results, &result_rows(&run.log, &run.confirmations))?;
    write_buckets(&paths.per_second, &run.aggregate.buckets)?;
    write_cdf(&paths.cdf, &run.aggregate.latency_cdf())?;
    write_json(
        &paths.summary,
        &serde_json::json!({
            "started_at": run.started_at.to_rfc3339(),
            "aborted": run.aborted,
            "summary": run.summary(),
            "fire": run.fire,
            "confirmation": run.poll,
        }),
    )?;

    info!(
        "Results written to {}, {}, {}, {}",
        paths.results.display(),
        paths.per_second.display(),
        paths.cdf.display(),
        paths.summary.display()
    );
    Ok(())
}

fn write_sweep(dir: &Path, prefix: &str, stamp: &str, summary: &SweepSummary) -> Result<()> {
    let (csv_path, json_path) = sweep_paths(dir, prefix, stamp);
    write_summaries(&csv_path, &summary.runs)?;
    write_json(&json_path, summary)?;
    info!(
        "Sweep summary written to {} and {}",
        csv_path.display(),
        json_path.display()
    );
    Ok(())
}

fn fmt_latency(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.3}s", v))
}

fn print_summary(summary: &RunSummary, aborted: bool) {
    println!("\n=== Run @ {} req/s Summary ===", summary.requested_rate);
    if aborted {
        println!("(aborted: partial results)");
    }
    println!("Duration: {:.2}s", summary.duration_s);
    println!("Total: {}", summary.total);
    println!("OK: {}", summary.ok);
    println!("Failed: {}", summary.fail);
    println!("Confirmed in store: {}", summary.confirmed);
    println!("OK ratio: {:.4}", summary.ok_ratio);
    println!("Confirm ratio: {:.4}", summary.confirm_ratio);
    println!("Mean TPS: {:.2}", summary.mean_tps);
    println!("Max TPS: {}", summary.max_tps);
    println!("E2E latency p50: {}", fmt_latency(summary.latency_p50_s));
    println!("E2E latency p95: {}", fmt_latency(summary.latency_p95_s));
    println!("E2E latency p99: {}", fmt_latency(summary.latency_p99_s));
    println!(
        "Request latency mean/p50/p95: {} / {} / {}",
        fmt_latency(summary.request_latency_mean_s),
        fmt_latency(summary.request_latency_p50_s),
        fmt_latency(summary.request_latency_p95_s)
    );
    println!();
}

fn print_sweep(sweep: &SweepSummary) {
    println!("\n=== Sweep ({} rates) ===", sweep.runs.len());
    println!(
        "{:>10} {:>10} {:>8} {:>8} {:>10} {:>10} {:>10}",
        "rate", "mean_tps", "ok", "conf", "p50", "p95", "p99"
    );
    for s in &sweep.runs {
        println!(
            "{:>10} {:>10.2} {:>8.4} {:>8.4} {:>10} {:>10} {:>10}",
            s.requested_rate,
            s.mean_tps,
            s.ok_ratio,
            s.confirm_ratio,
            fmt_latency(s.latency_p50_s),
            fmt_latency(s.latency_p95_s),
            fmt_latency(s.latency_p99_s)
        );
    }
    if let (Some(rate), Some(tps)) = (sweep.peak_rate, sweep.peak_mean_tps) {
        println!("Peak mean TPS {:.2} at {} req/s", tps, rate);
    }
    println!();
}
