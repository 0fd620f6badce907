use anyhow::{Context, Result};
use clap::Parser;
use loadgen_core::{
    Benchmark, Config, HttpTransport, MockTransport, PacingModel, PhaseConsumer, PhaseSummary,
    StatisticPhase, Transport,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "HTTP load worker - drives paced requests and records per-second latency")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Transport mode: mock or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// Worker ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Run identifier shared by all workers of one run
    #[arg(long)]
    run_id: Option<String>,

    /// Target URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Connection count (overrides config)
    #[arg(long)]
    connections: Option<usize>,

    /// Requests per second per connection, 0 for closed (overrides config)
    #[arg(long)]
    rate: Option<f64>,

    /// Pacing model: closed, fixed_rate, scheduled_closed, semi_open
    #[arg(long)]
    pacing: Option<PacingModel>,

    /// Simulated service time in mock mode
    #[arg(long, default_value = "5")]
    mock_latency_ms: u64,
}

/// Everything one worker measured, as exchanged with the controller.
#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    worker_id: String,
    run_id: String,
    timestamp: String,
    mode: String,
    phases: Vec<StatisticPhase>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.benchmark.threads)
        .thread_name("loadgen-io")
        .enable_all()
        .build()
        .context("Failed to start I/O threads")?;

    runtime.block_on(run(config, args))
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(worker_id) = &args.worker_id {
        config.worker.id = worker_id.clone();
    }
    if let Some(url) = &args.url {
        config.benchmark.url = url.clone();
    }
    if let Some(connections) = args.connections {
        config.benchmark.connections = connections;
    }
    if let Some(rate) = args.rate {
        config.benchmark.rate = rate;
    }
    if let Some(pacing) = args.pacing {
        config.benchmark.pacing = pacing;
    }
}

async fn run(config: Config, args: Args) -> Result<()> {
    let bench = &config.benchmark;
    info!(
        "Starting worker '{}' in {} mode",
        config.worker.id, args.mode
    );
    info!("Target: {}", bench.url);
    info!(
        "Threads: {}, connections: {}, rate: {}/s per connection, pacing: {}",
        bench.threads,
        bench.connections,
        bench.rate,
        bench.effective_pacing()
    );

    let transport: Arc<dyn Transport> = match args.mode.as_str() {
        "mock" => Arc::new(MockTransport::new(Duration::from_millis(args.mock_latency_ms))),
        "http" => Arc::new(HttpTransport::new(bench.timeout())),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };
    info!("Using transport: {}", transport.name());

    let benchmark = Benchmark::new(config.benchmark.clone(), config.histogram, transport)
        .context("Failed to set up benchmark")?;

    let mut printer = |phase: &StatisticPhase| print_summary(&phase.summary());
    let phases = benchmark
        .run(&mut printer as &mut dyn PhaseConsumer)
        .await
        .context("Benchmark failed")?;

    let run_id = args
        .run_id
        .unwrap_or_else(|| chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string());
    let result = WorkerResult {
        worker_id: config.worker.id.clone(),
        run_id: run_id.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: args.mode,
        phases,
    };
    let output_path = write_result(&config.worker.results_dir, &result)?;
    info!("Results written to {}", output_path.display());

    Ok(())
}

fn write_result(results_dir: &str, result: &WorkerResult) -> Result<PathBuf> {
    std::fs::create_dir_all(results_dir)
        .with_context(|| format!("Failed to create {results_dir}"))?;
    let output_path = Path::new(results_dir).join(format!(
        "worker_{}_{}.json",
        result.worker_id, result.run_id
    ));
    let result_json = serde_json::to_string_pretty(result)?;
    std::fs::write(&output_path, result_json)?;
    Ok(output_path)
}

fn print_summary(summary: &PhaseSummary) {
    let ms = |us: f64| us / 1000.0;
    println!("\n=== Phase '{}' ===", summary.name);
    println!("Started: {}", summary.started_at.to_rfc3339());
    println!("Duration: {}ms", summary.duration_ms);
    println!(
        "Connections: {} ({} lost)",
        summary.connections, summary.lost_connections
    );
    println!("Requests: {}", summary.requests);
    println!("Errors: {}", summary.errors);
    println!(
        "Throughput: mean {:.1}/s, max {}/s, stddev {:.2}, {:.1}% within 1 stddev",
        summary.throughput.mean,
        summary.throughput.max,
        summary.throughput.std_dev,
        summary.throughput.pct_within_one_std_dev
    );
    println!(
        "Latency: mean {:.3}ms, max {:.3}ms, stddev {:.3}ms, {:.1}% within 1 stddev",
        ms(summary.latency.mean),
        ms(summary.latency.max as f64),
        ms(summary.latency.std_dev),
        summary.latency.pct_within_one_std_dev
    );
    let p = &summary.percentiles;
    println!(
        "Latency p50: {:.3}ms  p75: {:.3}ms  p90: {:.3}ms  p99: {:.3}ms  p99.9: {:.3}ms",
        ms(p.p50_us as f64),
        ms(p.p75_us as f64),
        ms(p.p90_us as f64),
        ms(p.p99_us as f64),
        ms(p.p999_us as f64)
    );
    println!();
}
