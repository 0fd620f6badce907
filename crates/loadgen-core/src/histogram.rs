use crate::config::HistogramConfig;
use crate::error::LoadError;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Latency histogram, values in microseconds.
pub type LatencyHistogram = Histogram<u64>;

impl HistogramConfig {
    /// Allocate an empty histogram with these bounds. Auto-resize stays off,
    /// so recording into it never allocates.
    pub fn build(&self) -> Result<LatencyHistogram, LoadError> {
        Histogram::new_with_bounds(self.lowest_us, self.highest_us, self.significant_digits)
            .map_err(|e| LoadError::Histogram(format!("{e:?}")))
    }
}

/// Add `from` into `into`. Values beyond the target's range are clamped to
/// its highest trackable value instead of being lost.
pub fn union(into: &mut LatencyHistogram, from: &LatencyHistogram) {
    if into.add(from).is_ok() {
        return;
    }
    for v in from.iter_recorded() {
        let value = v.value_iterated_to().min(into.high());
        let _ = into.record_n(value, v.count_at_value());
    }
}

/// Wire form of a histogram: its bounds plus the non-empty (value, count)
/// pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    lowest: u64,
    highest: u64,
    significant_digits: u8,
    counts: Vec<(u64, u64)>,
}

impl Snapshot {
    fn capture(hist: &LatencyHistogram) -> Self {
        Self {
            lowest: hist.low(),
            highest: hist.high(),
            significant_digits: hist.sigfig(),
            counts: hist
                .iter_recorded()
                .map(|v| (v.value_iterated_to(), v.count_at_value()))
                .collect(),
        }
    }

    fn restore(self) -> Result<LatencyHistogram, LoadError> {
        let config = HistogramConfig {
            lowest_us: self.lowest,
            highest_us: self.highest,
            significant_digits: self.significant_digits,
        };
        let mut hist = config.build()?;
        for (value, count) in self.counts {
            hist.record_n(value.min(hist.high()), count)
                .map_err(|e| LoadError::Histogram(format!("{e:?}")))?;
        }
        Ok(hist)
    }
}

/// `#[serde(with = "...")]` adapter for [`LatencyHistogram`] fields.
pub mod serde_histogram {
    use super::{LatencyHistogram, Snapshot};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(hist: &LatencyHistogram, s: S) -> Result<S::Ok, S::Error> {
        Snapshot::capture(hist).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<LatencyHistogram, D::Error> {
        Snapshot::deserialize(d)?
            .restore()
            .map_err(D::Error::custom)
    }
}
