use std::time::Duration;
use tokio::time::Instant;

/// Request schedule using integer-only math: slot `i` lies at
/// `anchor + i / rate` seconds, computed from the rate in requests per
/// thousand seconds so fractional rates stay exact and slots never drift.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Target rate scaled by SCALE (requests per 1000 s)
    scaled_rate: u128,
    /// Time of slot 0, set lazily on first use
    anchor: Option<Instant>,
}

const NANOS_PER_SECOND: u128 = 1_000_000_000;
const SCALE: u128 = 1_000;

impl Schedule {
    pub fn new(rate: f64) -> Self {
        let scaled = (rate * SCALE as f64).round();
        Self {
            scaled_rate: if scaled >= 1.0 { scaled as u128 } else { 1 },
            anchor: None,
        }
    }

    /// Forget the anchor so the next phase starts a fresh schedule.
    pub fn reset(&mut self) {
        self.anchor = None;
    }

    pub fn anchor(&self) -> Option<Instant> {
        self.anchor
    }

    /// Return the anchor, fixing it at `now` on first invocation.
    pub fn anchor_or_init(&mut self, now: Instant) -> Instant {
        *self.anchor.get_or_insert(now)
    }

    /// Intended time of slot `index` relative to `anchor`.
    pub fn slot(&self, anchor: Instant, index: u64) -> Instant {
        let offset = (index as u128) * NANOS_PER_SECOND * SCALE / self.scaled_rate;
        anchor + Duration::from_nanos(offset.min(u64::MAX as u128) as u64)
    }

    /// Nominal gap between consecutive slots.
    pub fn interval(&self) -> Duration {
        let nanos = NANOS_PER_SECOND * SCALE / self.scaled_rate;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}
