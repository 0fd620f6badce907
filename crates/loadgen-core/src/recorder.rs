use crate::config::HistogramConfig;
use crate::error::LoadError;
use crate::histogram::LatencyHistogram;
use std::time::Duration;
use tokio::time::Instant;

const ONE_SECOND: Duration = Duration::from_secs(1);

/// One second of a connection's phase.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Completed requests (any status), latency in microseconds
    pub latency: LatencyHistogram,
    /// Non-2xx responses and transport failures
    pub errors: u64,
}

impl Bucket {
    pub fn new(config: &HistogramConfig) -> Result<Self, LoadError> {
        Ok(Self {
            latency: config.build()?,
            errors: 0,
        })
    }

    /// Completed requests in this second.
    pub fn requests(&self) -> u64 {
        self.latency.len()
    }

    fn clear(&mut self) {
        self.latency.reset();
        self.errors = 0;
    }
}

/// Records completions into per-second buckets of a pre-sized array.
///
/// The bucket index is cached together with the instant at which the next
/// bucket begins, so the common case is a single comparison and the division
/// only happens once per second of wall-clock time.
#[derive(Debug)]
pub struct BucketRecorder {
    config: HistogramConfig,
    buckets: Vec<Bucket>,
    start: Instant,
    current: usize,
    next_boundary: Instant,
    /// Samples that landed past the last bucket and were folded into it
    overflow: u64,
}

impl BucketRecorder {
    pub fn new(config: HistogramConfig, seconds: usize, start: Instant) -> Result<Self, LoadError> {
        let mut recorder = Self {
            config,
            buckets: Vec::new(),
            start,
            current: 0,
            next_boundary: start + ONE_SECOND,
            overflow: 0,
        };
        recorder.reset(start, seconds)?;
        Ok(recorder)
    }

    /// Prepare for a new phase. Existing buckets are cleared in place when the
    /// length matches; otherwise the array is reallocated here, never on the
    /// recording path.
    pub fn reset(&mut self, start: Instant, seconds: usize) -> Result<(), LoadError> {
        let seconds = seconds.max(1);
        if self.buckets.len() == seconds {
            self.buckets.iter_mut().for_each(Bucket::clear);
        } else {
            self.buckets = (0..seconds)
                .map(|_| Bucket::new(&self.config))
                .collect::<Result<_, _>>()?;
        }
        self.start = start;
        self.current = 0;
        self.next_boundary = start + ONE_SECOND;
        self.overflow = 0;
        Ok(())
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Map `now` to a bucket index, clamped to the last bucket.
    pub fn bucket_index(&mut self, now: Instant) -> usize {
        if now < self.next_boundary {
            return self.current;
        }
        let elapsed = now.saturating_duration_since(self.start).as_nanos();
        let second = (elapsed / ONE_SECOND.as_nanos()) as usize;
        let last = self.buckets.len().saturating_sub(1);

        self.current = second.min(last);
        self.next_boundary = self.start + ONE_SECOND * (second as u32 + 1);
        self.current
    }

    /// Record a completed request.
    pub fn record(&mut self, now: Instant, latency: Duration, success: bool) {
        if self.buckets.is_empty() {
            return;
        }
        let index = self.index_for_sample(now);
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        let bucket = &mut self.buckets[index];
        bucket.latency.saturating_record(micros);
        if !success {
            bucket.errors += 1;
        }
    }

    /// Record a request that failed before producing a response.
    pub fn record_error(&mut self, now: Instant) {
        if self.buckets.is_empty() {
            return;
        }
        let index = self.index_for_sample(now);
        self.buckets[index].errors += 1;
    }

    /// Hand the bucket array over to the caller; the recorder is empty until
    /// the next [`reset`](Self::reset).
    pub fn take_buckets(&mut self) -> Vec<Bucket> {
        std::mem::take(&mut self.buckets)
    }

    fn index_for_sample(&mut self, now: Instant) -> usize {
        let index = self.bucket_index(now);
        if index + 1 == self.buckets.len() && now >= self.phase_end() {
            self.overflow += 1;
        }
        index
    }

    fn phase_end(&self) -> Instant {
        self.start + ONE_SECOND * self.buckets.len() as u32
    }
}
