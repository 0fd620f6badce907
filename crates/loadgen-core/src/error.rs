use crate::config::HistogramConfig;
use thiserror::Error;

/// Setup-time configuration problems. All of them are fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("threads must be greater than zero")]
    Threads,

    #[error("connections must be greater than zero")]
    Connections,

    #[error("duration_secs must be greater than zero")]
    Duration,

    #[error("rate must be a finite number >= 0 (got {0})")]
    Rate(f64),

    #[error("Invalid URL {url}: {reason}")]
    Url { url: String, reason: String },

    #[error("task probability must be within [0, 1] (got {0})")]
    Probability(f64),

    #[error("task probabilities sum to {0}, above 1.0")]
    WeightsExceedOne(f64),

    #[error("Invalid histogram bounds: {0:?}")]
    Histogram(HistogramConfig),
}

/// Failure of a single request. Never fatal to the phase.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    /// The connection is gone and cannot carry further requests.
    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to open connection {index}: {source}")]
    Connect {
        index: usize,
        #[source]
        source: TransportError,
    },

    #[error("Histogram error: {0}")]
    Histogram(String),

    #[error("Connection driver failed: {0}")]
    Driver(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
