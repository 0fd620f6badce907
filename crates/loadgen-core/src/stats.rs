//! Cross-connection aggregation of per-second buckets.
//!
//! Ticks are keyed by their second relative to the phase start. Merging,
//! whether across connections or across nodes, unions latency histograms and
//! sums counters tick by tick. A source with fewer ticks than its peers
//! contributes nothing to the missing seconds (zero-padding), so an early
//! disconnect shows up as lower throughput, never as a shorter phase.

use crate::config::HistogramConfig;
use crate::driver::ConnectionReport;
use crate::error::LoadError;
use crate::histogram::{serde_histogram, union, LatencyHistogram};
use crate::recorder::Bucket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One merged second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticTick {
    #[serde(with = "serde_histogram")]
    pub latency: LatencyHistogram,
    /// Completed requests in this second
    pub requests: u64,
    pub errors: u64,
}

impl StatisticTick {
    pub fn empty(config: &HistogramConfig) -> Result<Self, LoadError> {
        Ok(Self {
            latency: config.build()?,
            requests: 0,
            errors: 0,
        })
    }

    pub fn absorb_bucket(&mut self, bucket: &Bucket) {
        union(&mut self.latency, &bucket.latency);
        self.requests += bucket.requests();
        self.errors += bucket.errors;
    }

    pub fn absorb(&mut self, other: &StatisticTick) {
        union(&mut self.latency, &other.latency);
        self.requests += other.requests;
        self.errors += other.errors;
    }
}

/// Merge per-connection bucket arrays into one tick per second.
pub fn merge_buckets<'a>(
    config: &HistogramConfig,
    connections: impl IntoIterator<Item = &'a [Bucket]>,
) -> Result<Vec<StatisticTick>, LoadError> {
    let connections: Vec<&[Bucket]> = connections.into_iter().collect();
    let len = connections.iter().map(|b| b.len()).max().unwrap_or(0);
    let mut ticks = (0..len)
        .map(|_| StatisticTick::empty(config))
        .collect::<Result<Vec<_>, _>>()?;
    for buckets in connections {
        for (tick, bucket) in ticks.iter_mut().zip(buckets.iter()) {
            tick.absorb_bucket(bucket);
        }
    }
    Ok(ticks)
}

/// Summary of a series: either per-tick request counts (throughput) or
/// latency samples in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RateStatistics {
    pub mean: f64,
    pub max: u64,
    pub std_dev: f64,
    /// Percentage of mass within one standard deviation of the mean
    pub pct_within_one_std_dev: f64,
    pub total_sum: u64,
    pub total_count: u64,
}

impl RateStatistics {
    /// Classic statistics over a list of counters.
    pub fn from_counters(counters: &[u64]) -> Self {
        if counters.is_empty() {
            return Self::default();
        }
        let n = counters.len() as f64;
        let total_sum: u64 = counters.iter().sum();
        let mean = total_sum as f64 / n;
        let variance = counters
            .iter()
            .map(|&c| {
                let d = c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt();
        let within = counters
            .iter()
            .filter(|&&c| (c as f64 - mean).abs() <= std_dev)
            .count();

        Self {
            mean,
            max: counters.iter().copied().max().unwrap_or(0),
            std_dev,
            pct_within_one_std_dev: within as f64 * 100.0 / n,
            total_sum,
            total_count: counters.len() as u64,
        }
    }

    /// Statistics read off a histogram. The within-one-stddev share walks the
    /// histogram's buckets rather than raw samples.
    pub fn from_histogram(hist: &LatencyHistogram) -> Self {
        if hist.len() == 0 {
            return Self::default();
        }
        let mean = hist.mean();
        let std_dev = hist.stdev();
        let (low, high) = (mean - std_dev, mean + std_dev);

        let mut within = 0u64;
        let mut total_sum = 0u64;
        for v in hist.iter_recorded() {
            let value = hist.median_equivalent(v.value_iterated_to());
            let count = v.count_at_value();
            total_sum = total_sum.saturating_add(value.saturating_mul(count));
            if (low..=high).contains(&(value as f64)) {
                within += count;
            }
        }

        Self {
            mean,
            max: hist.max(),
            std_dev,
            pct_within_one_std_dev: within as f64 * 100.0 / hist.len() as f64,
            total_sum,
            total_count: hist.len(),
        }
    }
}

/// Latency quantiles in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_us: u64,
    pub p75_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
}

impl LatencyPercentiles {
    pub fn from_histogram(hist: &LatencyHistogram) -> Self {
        if hist.len() == 0 {
            return Self::default();
        }
        Self {
            p50_us: hist.value_at_quantile(0.50),
            p75_us: hist.value_at_quantile(0.75),
            p90_us: hist.value_at_quantile(0.90),
            p99_us: hist.value_at_quantile(0.99),
            p999_us: hist.value_at_quantile(0.999),
        }
    }
}

/// A finished phase: per-second ticks merged over all connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticPhase {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub connections: usize,
    pub lost_connections: usize,
    pub ticks: Vec<StatisticTick>,
}

impl StatisticPhase {
    pub fn new(
        name: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        ticks: Vec<StatisticTick>,
    ) -> Self {
        Self {
            name: name.into(),
            started_at,
            duration,
            connections: 0,
            lost_connections: 0,
            ticks,
        }
    }

    /// Build a phase from the reports of every connection.
    pub fn from_reports(
        name: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        config: &HistogramConfig,
        reports: &[ConnectionReport],
    ) -> Result<Self, LoadError> {
        let ticks = merge_buckets(config, reports.iter().map(|r| r.buckets.as_slice()))?;
        let mut phase = Self::new(name, started_at, duration, ticks);
        phase.connections = reports.len();
        phase.lost_connections = reports.iter().filter(|r| r.lost).count();
        Ok(phase)
    }

    /// Fold `other` into this phase tick by tick.
    pub fn merge(&mut self, other: &StatisticPhase) {
        for (index, tick) in other.ticks.iter().enumerate() {
            match self.ticks.get_mut(index) {
                Some(mine) => mine.absorb(tick),
                None => self.ticks.push(tick.clone()),
            }
        }
        self.started_at = self.started_at.min(other.started_at);
        self.duration = self.duration.max(other.duration);
        self.connections += other.connections;
        self.lost_connections += other.lost_connections;
    }

    /// Merge a list of partial results (e.g. one per node) for the same phase.
    pub fn merge_all(phases: impl IntoIterator<Item = StatisticPhase>) -> Option<StatisticPhase> {
        let mut phases = phases.into_iter();
        let mut merged = phases.next()?;
        for phase in phases {
            merged.merge(&phase);
        }
        Some(merged)
    }

    pub fn total_requests(&self) -> u64 {
        self.ticks.iter().map(|t| t.requests).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.ticks.iter().map(|t| t.errors).sum()
    }

    /// Requests per second across all connections.
    pub fn throughput(&self) -> RateStatistics {
        let counters: Vec<u64> = self.ticks.iter().map(|t| t.requests).collect();
        RateStatistics::from_counters(&counters)
    }

    pub fn latency(&self) -> RateStatistics {
        self.latency_histogram()
            .map(|h| RateStatistics::from_histogram(&h))
            .unwrap_or_default()
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        self.latency_histogram()
            .map(|h| LatencyPercentiles::from_histogram(&h))
            .unwrap_or_default()
    }

    /// Union of every tick's latency histogram.
    pub fn latency_histogram(&self) -> Option<LatencyHistogram> {
        let (first, rest) = self.ticks.split_first()?;
        let mut hist = first.latency.clone();
        for tick in rest {
            union(&mut hist, &tick.latency);
        }
        Some(hist)
    }

    pub fn summary(&self) -> PhaseSummary {
        PhaseSummary {
            name: self.name.clone(),
            started_at: self.started_at,
            duration_ms: self.duration.as_millis() as u64,
            connections: self.connections,
            lost_connections: self.lost_connections,
            requests: self.total_requests(),
            errors: self.total_errors(),
            throughput: self.throughput(),
            latency: self.latency(),
            percentiles: self.percentiles(),
        }
    }
}

/// Flat, printable view of a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub connections: usize,
    pub lost_connections: usize,
    pub requests: u64,
    pub errors: u64,
    pub throughput: RateStatistics,
    pub latency: RateStatistics,
    pub percentiles: LatencyPercentiles,
}
