use crate::error::{ConfigError, LoadError};
use crate::pacing::PacingModel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub histogram: HistogramConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, LoadError> {
        toml::from_str(contents).map_err(|e| LoadError::Config(ConfigError::Parse(e.to_string())))
    }

    /// Validate every section. Nothing may be opened before this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.benchmark.validate()?;
        self.histogram.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// I/O threads hosting the connection drivers
    pub threads: usize,
    /// Number of concurrent connections
    pub connections: usize,
    /// Target URL for the primary task
    pub url: String,
    /// Measurement phase duration in seconds
    pub duration_secs: u64,
    /// Warm-up phase duration in seconds (0 disables warm-up)
    #[serde(default)]
    pub warm_up_secs: u64,
    /// Requests per second per connection; 0 selects the closed model
    #[serde(default)]
    pub rate: f64,
    /// Per-request I/O timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub pacing: PacingModel,
    /// Seed for the request-mix RNG
    #[serde(default)]
    pub seed: u64,
    /// Additional weighted tasks (multi-task mode)
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    /// Grace period for outstanding requests after a phase stops
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::Threads);
        }
        if self.connections == 0 {
            return Err(ConfigError::Connections);
        }
        if self.duration_secs == 0 {
            return Err(ConfigError::Duration);
        }
        if !self.rate.is_finite() || self.rate < 0.0 {
            return Err(ConfigError::Rate(self.rate));
        }
        parse_http_url(&self.url)?;

        let mut total = 0.0;
        for task in &self.tasks {
            parse_http_url(&task.url)?;
            if !(0.0..=1.0).contains(&task.probability) {
                return Err(ConfigError::Probability(task.probability));
            }
            total += task.probability;
        }
        // Allow for float noise such as 0.1 + 0.2 + 0.7.
        if total > 1.0 + 1e-9 {
            return Err(ConfigError::WeightsExceedOne(total));
        }
        Ok(())
    }

    pub fn target(&self) -> Result<Url, ConfigError> {
        parse_http_url(&self.url)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn warm_up(&self) -> Option<Duration> {
        (self.warm_up_secs > 0).then(|| Duration::from_secs(self.warm_up_secs))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Pacing model actually used: a zero rate always means closed.
    pub fn effective_pacing(&self) -> PacingModel {
        if self.rate == 0.0 {
            PacingModel::Closed
        } else {
            self.pacing
        }
    }
}

fn parse_http_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Url {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(ConfigError::Url {
            url: raw.to_string(),
            reason: "expected an http:// or https:// URL with a host".to_string(),
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub url: String,
    /// Probability that a request goes to this task
    pub probability: f64,
}

/// Trackable latency range shared by every recorder, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramConfig {
    pub lowest_us: u64,
    pub highest_us: u64,
    pub significant_digits: u8,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            lowest_us: 1,
            highest_us: 60_000_000,
            significant_digits: 2,
        }
    }
}

impl HistogramConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lowest_us == 0
            || self.highest_us < self.lowest_us.saturating_mul(2)
            || self.significant_digits > 5
        {
            return Err(ConfigError::Histogram(*self));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identifier used in result file names
    pub id: String,
    /// Directory receiving result files
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

fn default_results_dir() -> String {
    "results".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: "worker-0".to_string(),
            results_dir: default_results_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of local workers to spawn
    pub local_workers: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[benchmark]
threads = 2
connections = 8
url = "http://localhost:8080/"
duration_secs = 10
warm_up_secs = 2
rate = 100
timeout_ms = 1500
pacing = "scheduled_closed"
seed = 7

[[benchmark.tasks]]
url = "http://localhost:8080/slow"
probability = 0.25

[histogram]
lowest_us = 1
highest_us = 10000000
significant_digits = 3

[worker]
id = "test-worker"
"#;

    fn sample() -> Config {
        Config::from_toml(SAMPLE).unwrap()
    }

    #[test]
    fn test_config_serde() {
        let config = sample();
        assert_eq!(config.benchmark.threads, 2);
        assert_eq!(config.benchmark.connections, 8);
        assert_eq!(config.benchmark.pacing, PacingModel::ScheduledClosed);
        assert_eq!(config.benchmark.tasks.len(), 1);
        assert_eq!(config.benchmark.drain_timeout_ms, 2000);
        assert_eq!(config.histogram.significant_digits, 3);
        assert_eq!(config.worker.id, "test-worker");
        assert_eq!(config.worker.results_dir, "results");
        assert!(config.controller.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml(
            r#"
[benchmark]
threads = 1
connections = 1
url = "http://localhost/"
duration_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.benchmark.pacing, PacingModel::Closed);
        assert_eq!(config.benchmark.rate, 0.0);
        assert!(config.benchmark.warm_up().is_none());
        assert_eq!(config.histogram, HistogramConfig::default());
    }

    #[test]
    fn test_invalid_counts() {
        let mut config = sample();
        config.benchmark.threads = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Threads)));

        let mut config = sample();
        config.benchmark.connections = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Connections)));

        let mut config = sample();
        config.benchmark.duration_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Duration)));
    }

    #[test]
    fn test_invalid_rate_and_url() {
        let mut config = sample();
        config.benchmark.rate = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Rate(_))));

        let mut config = sample();
        config.benchmark.url = "ftp://example.com/".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Url { .. })));

        let mut config = sample();
        config.benchmark.url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Url { .. })));
    }

    #[test]
    fn test_task_weights_above_one() {
        let mut config = sample();
        config.benchmark.tasks.push(TaskConfig {
            url: "http://localhost:8080/b".to_string(),
            probability: 0.8,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WeightsExceedOne(_))
        ));
    }

    #[test]
    fn test_zero_rate_is_closed() {
        let mut config = sample();
        config.benchmark.rate = 0.0;
        assert_eq!(config.benchmark.effective_pacing(), PacingModel::Closed);
        config.benchmark.rate = 50.0;
        assert_eq!(
            config.benchmark.effective_pacing(),
            PacingModel::ScheduledClosed
        );
    }

    #[test]
    fn test_histogram_bounds() {
        let bad = HistogramConfig {
            lowest_us: 0,
            ..HistogramConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = HistogramConfig {
            significant_digits: 6,
            ..HistogramConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
