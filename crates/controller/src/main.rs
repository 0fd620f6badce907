use anyhow::{Context, Result};
use clap::Parser;
use loadgen_core::{Config, PhaseSummary, StatisticPhase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "HTTP load rig controller - spawns workers locally and merges their phases")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Dry run: print what would be executed without running
    #[arg(long)]
    dry_run: bool,

    /// Spawn N local worker processes
    #[arg(long = "local-workers", alias = "local", default_value_t = 0)]
    local_workers: u32,

    /// Transport mode passed to workers: mock or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// Merge an existing run's worker result JSONs without spawning workers.
    #[arg(long)]
    merge_run_id: Option<String>,
}

/// Worker output as written by the worker binary.
#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    worker_id: String,
    run_id: String,
    timestamp: String,
    mode: String,
    phases: Vec<StatisticPhase>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MergedResult {
    timestamp: String,
    run_id: String,
    worker_count: usize,
    workers: Vec<String>,
    phases: Vec<StatisticPhase>,
    summaries: Vec<PhaseSummary>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    config.validate().context("Invalid configuration")?;
    let results_dir = PathBuf::from(&config.worker.results_dir);

    let local_n = if args.local_workers > 0 {
        args.local_workers
    } else {
        config
            .controller
            .as_ref()
            .and_then(|c| c.local_workers)
            .unwrap_or(0)
    };

    if local_n == 0 {
        if let Some(run_id) = args.merge_run_id.as_deref() {
            let workers = collect_worker_results(&results_dir, run_id)?;
            if workers.is_empty() {
                anyhow::bail!("No worker results found for run_id={run_id}");
            }
            let merged = merge_results(run_id.to_string(), workers);
            save_merged_results(&results_dir, &merged)?;
            print_merged_summary(&merged);
            return Ok(());
        }

        info!("No --local-workers N provided and nothing to merge");
        return Ok(());
    }

    let run_id = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let worker_bin = infer_worker_binary().context("Failed to infer worker binary path")?;

    if args.dry_run {
        print_dry_run(&worker_bin, &args.config, local_n, &run_id, &args.mode);
        return Ok(());
    }

    info!(
        "Spawning {} local workers using {:?} (run_id={})",
        local_n, worker_bin, run_id
    );

    std::fs::create_dir_all(&results_dir).ok();
    std::fs::create_dir_all("runs").ok();

    let mut handles = Vec::new();
    for i in 0..local_n {
        let worker_id = format!("worker-{}", i);
        let worker_cfg_path =
            write_worker_config(&config, local_n, i, &run_id).context("write worker config")?;

        let mut cmd = Command::new(&worker_bin);
        cmd.arg("--config")
            .arg(&worker_cfg_path)
            .arg("--mode")
            .arg(&args.mode)
            .arg("--worker-id")
            .arg(&worker_id)
            .arg("--run-id")
            .arg(&run_id)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker {worker_id}"))?;

        handles.push(tokio::spawn(async move {
            let status = child.wait().await?;
            if !status.success() {
                anyhow::bail!("Worker {worker_id} exited with status {status}");
            }
            Ok::<(), anyhow::Error>(())
        }));
    }

    for h in handles {
        h.await??;
    }

    let workers = collect_worker_results(&results_dir, &run_id)?;
    if workers.is_empty() {
        anyhow::bail!("No worker results found for run_id={run_id}");
    }

    let merged = merge_results(run_id.clone(), workers);
    save_merged_results(&results_dir, &merged)?;
    print_merged_summary(&merged);

    Ok(())
}

fn print_dry_run(worker_bin: &Path, config: &Path, local_n: u32, run_id: &str, mode: &str) {
    println!("\n=== Dry Run ===");
    println!("worker_bin: {:?}", worker_bin);
    println!("config: {:?}", config);
    println!("local workers: {}", local_n);
    println!("run_id: {}", run_id);
    println!("\nWould execute:");

    for i in 0..local_n {
        println!(
            "  {:?} --config runs/run_{}_worker_{}.toml --mode {} --worker-id worker-{} --run-id {}",
            worker_bin, run_id, i, mode, i, run_id
        );
    }
    println!();
}

/// Share of `total` connections for worker `worker_idx`; the remainder goes
/// to the first workers. Every worker keeps at least one connection.
fn split_connections(total: usize, workers: u32, worker_idx: u32) -> usize {
    if workers == 0 {
        return total;
    }
    let workers = workers as usize;
    let base = total / workers;
    let rem = total % workers;
    let share = if (worker_idx as usize) < rem {
        base + 1
    } else {
        base
    };
    share.max(1)
}

fn write_worker_config(
    base: &Config,
    workers: u32,
    worker_idx: u32,
    run_id: &str,
) -> Result<PathBuf> {
    let mut cfg = base.clone();
    cfg.benchmark.connections = split_connections(base.benchmark.connections, workers, worker_idx);
    cfg.benchmark.seed = base.benchmark.seed.wrapping_add((worker_idx as u64) << 32);
    cfg.worker.id = format!("worker-{worker_idx}");
    cfg.controller = None;

    let out = PathBuf::from(format!("runs/run_{run_id}_worker_{worker_idx}.toml"));
    let s = toml::to_string_pretty(&cfg)?;
    std::fs::write(&out, s)?;
    Ok(out)
}

fn infer_worker_binary() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("WORKER_BIN") {
        return Ok(PathBuf::from(p));
    }

    let exe = std::env::current_exe()?;
    let exe_dir = exe
        .parent()
        .context("current_exe has no parent directory")?;

    // Prefer a worker built next to this controller.
    let candidate = exe_dir.join("worker");
    if candidate.exists() {
        return Ok(candidate);
    }

    for p in ["target/release/worker", "target/debug/worker"] {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
    }

    anyhow::bail!("Could not find worker binary. Build it first (cargo build --bin worker).")
}

fn collect_worker_results(results_dir: &Path, run_id: &str) -> Result<Vec<WorkerResult>> {
    let mut results = Vec::new();

    if !results_dir.exists() {
        return Ok(results);
    }

    for entry in std::fs::read_dir(results_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let name = match path.file_name().and_then(|s| s.to_str()) {
            Some(n) => n,
            None => continue,
        };

        if !name.starts_with("worker_") {
            continue;
        }
        if !name.ends_with(&format!("_{run_id}.json")) {
            continue;
        }

        let content = std::fs::read_to_string(&path)?;
        let result: WorkerResult = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        results.push(result);
    }

    results.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Ok(results)
}

/// Merge every worker's phases by name, preserving first-seen phase order.
fn merge_results(run_id: String, workers: Vec<WorkerResult>) -> MergedResult {
    let worker_count = workers.len();
    let worker_ids = workers.iter().map(|w| w.worker_id.clone()).collect();

    let mut order: Vec<String> = Vec::new();
    let mut by_name: BTreeMap<String, Vec<StatisticPhase>> = BTreeMap::new();
    for phase in workers.into_iter().flat_map(|w| w.phases) {
        if !by_name.contains_key(&phase.name) {
            order.push(phase.name.clone());
        }
        by_name.entry(phase.name.clone()).or_default().push(phase);
    }

    let phases: Vec<StatisticPhase> = order
        .iter()
        .filter_map(|name| by_name.remove(name))
        .filter_map(StatisticPhase::merge_all)
        .collect();
    let summaries = phases.iter().map(StatisticPhase::summary).collect();

    MergedResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        run_id,
        worker_count,
        workers: worker_ids,
        phases,
        summaries,
    }
}

fn save_merged_results(results_dir: &Path, merged: &MergedResult) -> Result<()> {
    std::fs::create_dir_all(results_dir).ok();
    let output_path = results_dir.join(format!("run_{}_merged.json", merged.run_id));
    let result_json = serde_json::to_string_pretty(merged)?;
    std::fs::write(&output_path, result_json)?;
    info!("Merged results written to {}", output_path.display());
    Ok(())
}

fn print_merged_summary(merged: &MergedResult) {
    println!(
        "\n=== Merged Results ({} workers, run_id={}) ===",
        merged.worker_count, merged.run_id
    );
    for s in &merged.summaries {
        println!();
        println!("Phase: {}", s.name);
        println!("Duration: {}ms", s.duration_ms);
        println!(
            "Connections: {} ({} lost)",
            s.connections, s.lost_connections
        );
        println!("Total requests: {}", s.requests);
        println!("Total errors: {}", s.errors);
        println!(
            "Throughput: mean {:.1}/s, max {}/s, stddev {:.2}",
            s.throughput.mean, s.throughput.max, s.throughput.std_dev
        );
        println!(
            "Latency: mean {:.3}ms, max {:.3}ms, stddev {:.3}ms",
            s.latency.mean / 1000.0,
            s.latency.max as f64 / 1000.0,
            s.latency.std_dev / 1000.0
        );
        println!(
            "Latency p50: {:.3}ms  p99: {:.3}ms  p99.9: {:.3}ms",
            s.percentiles.p50_us as f64 / 1000.0,
            s.percentiles.p99_us as f64 / 1000.0,
            s.percentiles.p999_us as f64 / 1000.0
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgen_core::{merge_buckets, Bucket, HistogramConfig};
    use std::time::Duration;

    fn phase(name: &str, counts: &[u64]) -> StatisticPhase {
        let config = HistogramConfig::default();
        let buckets: Vec<Bucket> = counts
            .iter()
            .map(|&n| {
                let mut b = Bucket::new(&config).unwrap();
                b.latency.record_n(1_000, n).unwrap();
                b
            })
            .collect();
        let ticks = merge_buckets(&config, [buckets.as_slice()]).unwrap();
        let mut phase =
            StatisticPhase::new(name, chrono::Utc::now(), Duration::from_secs(2), ticks);
        phase.connections = 1;
        phase
    }

    fn worker(id: &str, phases: Vec<StatisticPhase>) -> WorkerResult {
        WorkerResult {
            worker_id: id.to_string(),
            run_id: "r".to_string(),
            timestamp: String::new(),
            mode: "mock".to_string(),
            phases,
        }
    }

    #[test]
    fn test_split_connections() {
        let shares: Vec<usize> = (0..3).map(|i| split_connections(10, 3, i)).collect();
        assert_eq!(shares, vec![4, 3, 3]);
        assert_eq!(split_connections(2, 4, 3), 1);
        assert_eq!(split_connections(5, 0, 0), 5);
    }

    #[test]
    fn test_merge_results_by_phase_name() {
        let workers = vec![
            worker("w0", vec![phase("warm-up", &[5]), phase("test", &[10, 10])]),
            worker("w1", vec![phase("warm-up", &[7]), phase("test", &[20, 30])]),
        ];
        let merged = merge_results("r".to_string(), workers);

        assert_eq!(merged.worker_count, 2);
        let names: Vec<&str> = merged.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["warm-up", "test"]);
        assert_eq!(merged.phases[0].total_requests(), 12);
        assert_eq!(merged.phases[1].ticks[1].requests, 40);
        assert_eq!(merged.summaries[1].connections, 2);
    }
}
