//! Pacing strategies: when a connection sends its next request.
//!
//! Every strategy is a pure decision function over a [`PacingContext`]. It
//! either fires now with an intended time, defers until a point in time, or
//! waits for the outstanding response. The driver turns `Defer` into a timer
//! on the event loop, so no strategy ever blocks or spins.

use crate::schedule::Schedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingModel {
    /// Next request only after the previous response
    #[default]
    Closed,
    /// Requests on a fixed schedule regardless of outstanding responses
    FixedRate,
    /// One in flight, latency measured from the connection's own schedule
    ScheduledClosed,
    /// One in flight, latency measured from the phase-wide schedule
    SemiOpen,
}

impl PacingModel {
    pub fn is_rate_based(&self) -> bool {
        !matches!(self, PacingModel::Closed)
    }
}

impl fmt::Display for PacingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacingModel::Closed => "closed",
            PacingModel::FixedRate => "fixed_rate",
            PacingModel::ScheduledClosed => "scheduled_closed",
            PacingModel::SemiOpen => "semi_open",
        };
        f.write_str(name)
    }
}

impl FromStr for PacingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "closed" => Ok(PacingModel::Closed),
            "fixed_rate" | "open" => Ok(PacingModel::FixedRate),
            "scheduled_closed" => Ok(PacingModel::ScheduledClosed),
            "semi_open" => Ok(PacingModel::SemiOpen),
            other => Err(format!(
                "unknown pacing model '{other}', expected closed, fixed_rate, scheduled_closed or semi_open"
            )),
        }
    }
}

/// Per-connection facts a strategy decides on.
#[derive(Debug, Clone, Copy)]
pub struct PacingContext {
    pub now: Instant,
    /// Phase start shared by every connection of the phase
    pub phase_start: Instant,
    /// Requests already issued in this phase
    pub sent: u64,
    /// Requests issued but not yet completed
    pub outstanding: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send now; latency is measured from `intended`.
    Fire { intended: Instant },
    /// Nothing to send before `until`.
    Defer { until: Instant },
    /// Nothing to send until an outstanding response arrives.
    AwaitResponse,
}

#[derive(Debug, Clone)]
pub enum Pacer {
    Closed,
    FixedRate(Schedule),
    ScheduledClosed(Schedule),
    SemiOpen(Schedule),
}

impl Pacer {
    pub fn new(model: PacingModel, rate: f64) -> Self {
        match model {
            _ if rate <= 0.0 => Pacer::Closed,
            PacingModel::Closed => Pacer::Closed,
            PacingModel::FixedRate => Pacer::FixedRate(Schedule::new(rate)),
            PacingModel::ScheduledClosed => Pacer::ScheduledClosed(Schedule::new(rate)),
            PacingModel::SemiOpen => Pacer::SemiOpen(Schedule::new(rate)),
        }
    }

    pub fn model(&self) -> PacingModel {
        match self {
            Pacer::Closed => PacingModel::Closed,
            Pacer::FixedRate(_) => PacingModel::FixedRate,
            Pacer::ScheduledClosed(_) => PacingModel::ScheduledClosed,
            Pacer::SemiOpen(_) => PacingModel::SemiOpen,
        }
    }

    /// Called at every phase start.
    pub fn reset(&mut self) {
        match self {
            Pacer::Closed => {}
            Pacer::FixedRate(s) | Pacer::ScheduledClosed(s) | Pacer::SemiOpen(s) => s.reset(),
        }
    }

    pub fn decide(&mut self, ctx: &PacingContext) -> Decision {
        match self {
            Pacer::Closed => {
                if ctx.outstanding > 0 {
                    Decision::AwaitResponse
                } else {
                    Decision::Fire { intended: ctx.now }
                }
            }
            Pacer::FixedRate(schedule) => {
                let anchor = schedule.anchor_or_init(ctx.now);
                on_schedule(schedule.slot(anchor, ctx.sent), ctx.now)
            }
            Pacer::ScheduledClosed(schedule) => {
                if ctx.outstanding > 0 {
                    return Decision::AwaitResponse;
                }
                let anchor = schedule.anchor_or_init(ctx.now);
                on_schedule(schedule.slot(anchor, ctx.sent), ctx.now)
            }
            Pacer::SemiOpen(schedule) => {
                if ctx.outstanding > 0 {
                    return Decision::AwaitResponse;
                }
                let anchor = schedule.anchor_or_init(ctx.phase_start);
                on_schedule(schedule.slot(anchor, ctx.sent), ctx.now)
            }
        }
    }
}

fn on_schedule(intended: Instant, now: Instant) -> Decision {
    if now < intended {
        Decision::Defer { until: intended }
    } else {
        Decision::Fire { intended }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx(start: Instant, now_ms: u64, sent: u64, outstanding: usize) -> PacingContext {
        PacingContext {
            now: start + Duration::from_millis(now_ms),
            phase_start: start,
            sent,
            outstanding,
        }
    }

    #[test]
    fn test_closed_waits_for_response() {
        let start = Instant::now();
        let mut pacer = Pacer::new(PacingModel::Closed, 0.0);

        let c = ctx(start, 5, 0, 0);
        assert_eq!(pacer.decide(&c), Decision::Fire { intended: c.now });
        assert_eq!(pacer.decide(&ctx(start, 6, 1, 1)), Decision::AwaitResponse);
    }

    #[test]
    fn test_fixed_rate_ignores_backlog() {
        let start = Instant::now();
        let mut pacer = Pacer::new(PacingModel::FixedRate, 100.0);

        // First invocation anchors the schedule.
        assert_eq!(
            pacer.decide(&ctx(start, 0, 0, 0)),
            Decision::Fire { intended: start }
        );
        // Slot 1 is 10ms out: defer even with requests outstanding.
        assert_eq!(
            pacer.decide(&ctx(start, 3, 1, 4)),
            Decision::Defer {
                until: start + Duration::from_millis(10)
            }
        );
        // Late: fire immediately, still baselined on the slot.
        assert_eq!(
            pacer.decide(&ctx(start, 55, 2, 9)),
            Decision::Fire {
                intended: start + Duration::from_millis(20)
            }
        );
    }

    #[test]
    fn test_scheduled_closed_anchors_lazily() {
        let start = Instant::now();
        let mut pacer = Pacer::new(PacingModel::ScheduledClosed, 10.0);
        let first = start + Duration::from_millis(30);

        assert_eq!(
            pacer.decide(&ctx(start, 30, 0, 0)),
            Decision::Fire { intended: first }
        );
        assert_eq!(pacer.decide(&ctx(start, 40, 1, 1)), Decision::AwaitResponse);
        // Response came back after two slots: the next request carries the
        // missed slot as its baseline.
        assert_eq!(
            pacer.decide(&ctx(start, 300, 1, 0)),
            Decision::Fire {
                intended: first + Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn test_semi_open_uses_phase_start() {
        let start = Instant::now();
        let mut pacer = Pacer::new(PacingModel::SemiOpen, 10.0);

        // Invoked late, but slot 0 is still the phase start.
        assert_eq!(
            pacer.decide(&ctx(start, 30, 0, 0)),
            Decision::Fire { intended: start }
        );
        assert_eq!(pacer.decide(&ctx(start, 31, 1, 1)), Decision::AwaitResponse);
        assert_eq!(
            pacer.decide(&ctx(start, 50, 1, 0)),
            Decision::Defer {
                until: start + Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn test_reset_clears_anchor() {
        let start = Instant::now();
        let mut pacer = Pacer::new(PacingModel::FixedRate, 1.0);
        pacer.decide(&ctx(start, 0, 0, 0));
        pacer.reset();

        let next_phase = start + Duration::from_secs(60);
        let c = PacingContext {
            now: next_phase,
            phase_start: next_phase,
            sent: 0,
            outstanding: 0,
        };
        assert_eq!(pacer.decide(&c), Decision::Fire { intended: next_phase });
    }

    #[test]
    fn test_zero_rate_falls_back_to_closed() {
        assert_eq!(
            Pacer::new(PacingModel::SemiOpen, 0.0).model(),
            PacingModel::Closed
        );
        assert_eq!("semi-open".parse::<PacingModel>(), Ok(PacingModel::SemiOpen));
        assert!("bogus".parse::<PacingModel>().is_err());
    }
}
