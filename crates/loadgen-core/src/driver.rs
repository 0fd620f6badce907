use crate::config::{BenchmarkConfig, HistogramConfig};
use crate::error::{LoadError, TransportError};
use crate::mix::RequestMix;
use crate::pacing::{Decision, Pacer, PacingContext};
use crate::recorder::{Bucket, BucketRecorder};
use crate::transport::{Completion, Connection, Response};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesOrdered, StreamExt};
use futures::FutureExt;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

/// Pacing decisions taken back-to-back before handing the thread back to the
/// runtime. Keeps a fast server from starving timers and other connections.
const YIELD_EVERY: u32 = 64;

/// Everything a driver needs to begin a phase.
#[derive(Debug, Clone)]
pub struct PhaseStart {
    pub name: String,
    pub start: Instant,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl PhaseStart {
    pub fn now(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
            started_at: Utc::now(),
            duration,
        }
    }

    /// Bucket count: one per started second of the phase.
    pub fn seconds(&self) -> usize {
        let secs = self.duration.as_secs() as usize;
        if self.duration.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

/// What one connection hands back when a phase ends.
#[derive(Debug)]
pub struct ConnectionReport {
    pub connection: usize,
    pub buckets: Vec<Bucket>,
    pub sent: u64,
    pub completed: u64,
    pub errors: u64,
    /// Completions after the phase end folded into the last bucket
    pub overflow: u64,
    /// Requests still outstanding when the drain grace ran out
    pub abandoned: u64,
    /// The connection was lost mid-phase
    pub lost: bool,
}

/// Per-phase state of one connection, owned by its driver alone.
struct ConnectionState {
    running: bool,
    started_at: DateTime<Utc>,
    start: Instant,
    /// Requests issued so far (the schedule index)
    sent: u64,
    /// Intended times of outstanding requests, oldest first
    intended: VecDeque<Instant>,
    /// Outstanding requests, resolved in issue order
    in_flight: FuturesOrdered<Completion>,
    completed: u64,
    errors: u64,
    lost: bool,
}

impl ConnectionState {
    fn idle() -> Self {
        Self {
            running: false,
            started_at: Utc::now(),
            start: Instant::now(),
            sent: 0,
            intended: VecDeque::new(),
            in_flight: FuturesOrdered::new(),
            completed: 0,
            errors: 0,
            lost: false,
        }
    }

    fn outstanding(&self) -> usize {
        self.intended.len()
    }
}

/// Binds one pacing strategy and one bucket recorder to one connection.
pub struct ConnectionDriver {
    id: usize,
    connection: Box<dyn Connection>,
    pacer: Pacer,
    recorder: BucketRecorder,
    mix: RequestMix,
    drain_timeout: Duration,
    state: ConnectionState,
}

impl ConnectionDriver {
    pub fn new(
        id: usize,
        connection: Box<dyn Connection>,
        config: &BenchmarkConfig,
        histogram: HistogramConfig,
    ) -> Result<Self, LoadError> {
        let pacer = Pacer::new(config.effective_pacing(), config.rate);
        Ok(Self {
            id,
            connection,
            pacer,
            recorder: BucketRecorder::new(histogram, config.duration_secs as usize, Instant::now())?,
            mix: RequestMix::new(config, id)?,
            drain_timeout: config.drain_timeout(),
            state: ConnectionState::idle(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    /// Drive load until `stop` flips, then drain and report.
    pub async fn run_phase(
        &mut self,
        phase: &PhaseStart,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ConnectionReport, LoadError> {
        self.start(phase)?;
        debug!(
            connection = self.id,
            phase = %phase.name,
            started_at = %self.state.started_at,
            "Connection started"
        );

        let mut iterations = 0u32;
        while self.state.running {
            if *stop.borrow() {
                self.state.running = false;
                break;
            }

            iterations += 1;
            if iterations % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }

            let ctx = PacingContext {
                now: Instant::now(),
                phase_start: self.state.start,
                sent: self.state.sent,
                outstanding: self.state.outstanding(),
            };
            match self.pacer.decide(&ctx) {
                Decision::Fire { intended } => {
                    self.fire(intended);
                    self.poll_ready();
                }
                Decision::Defer { until } => {
                    tokio::select! {
                        biased;
                        _ = stop.changed() => self.state.running = false,
                        Some(result) = self.state.in_flight.next() => self.complete(result),
                        _ = sleep_until(until) => {}
                    }
                }
                Decision::AwaitResponse => {
                    tokio::select! {
                        biased;
                        _ = stop.changed() => self.state.running = false,
                        next = self.state.in_flight.next() => match next {
                            Some(result) => self.complete(result),
                            None => {
                                return Err(LoadError::Driver(format!(
                                    "connection {} awaited a response with nothing outstanding",
                                    self.id
                                )))
                            }
                        },
                    }
                }
            }
        }

        let abandoned = self.drain().await;
        Ok(self.report(abandoned))
    }

    pub fn close(&mut self) {
        self.connection.close();
    }

    fn start(&mut self, phase: &PhaseStart) -> Result<(), LoadError> {
        self.recorder.reset(phase.start, phase.seconds())?;
        self.pacer.reset();
        self.state = ConnectionState {
            running: true,
            started_at: phase.started_at,
            start: phase.start,
            ..ConnectionState::idle()
        };
        Ok(())
    }

    fn fire(&mut self, intended: Instant) {
        let url = self.mix.next_url();
        let completion = self.connection.send_get(url);
        self.state.intended.push_back(intended);
        self.state.in_flight.push_back(completion);
        self.state.sent += 1;
    }

    fn complete(&mut self, result: Result<Response, TransportError>) {
        let Some(intended) = self.state.intended.pop_front() else {
            warn!(connection = self.id, "Completion without an outstanding request");
            return;
        };
        match result {
            Ok(response) => {
                let latency = response.completed_at.saturating_duration_since(intended);
                let success = response.is_success();
                self.recorder.record(response.completed_at, latency, success);
                self.state.completed += 1;
                if !success {
                    self.state.errors += 1;
                }
            }
            Err(TransportError::Disconnected(reason)) => {
                self.recorder.record_error(Instant::now());
                self.state.errors += 1;
                if !self.state.lost {
                    warn!(
                        connection = self.id,
                        %reason,
                        "Connection lost, no further load on it this phase"
                    );
                }
                self.state.lost = true;
                self.state.running = false;
            }
            Err(e) => {
                debug!(connection = self.id, error = %e, "Request failed");
                self.recorder.record_error(Instant::now());
                self.state.errors += 1;
            }
        }
    }

    /// Poll outstanding requests once without waiting. Completions are lazy,
    /// so overdue slots fired back to back only reach the wire when polled.
    fn poll_ready(&mut self) {
        while self.state.running {
            let Some(Some(result)) = self.state.in_flight.next().now_or_never() else {
                break;
            };
            self.complete(result);
        }
    }

    /// Let outstanding requests finish within the grace period. Returns how
    /// many were given up on.
    async fn drain(&mut self) -> u64 {
        let deadline = Instant::now() + self.drain_timeout;
        while !self.state.in_flight.is_empty() {
            let next = timeout_at(deadline, self.state.in_flight.next()).await;
            match next {
                Ok(Some(result)) => self.complete(result),
                Ok(None) | Err(_) => break,
            }
        }

        let abandoned = self.state.in_flight.len() as u64;
        if abandoned > 0 {
            debug!(connection = self.id, abandoned, "Dropped outstanding requests");
        }
        // The futures and their intended times go together, so no later
        // response can be paired with a stale baseline.
        self.state.in_flight = FuturesOrdered::new();
        self.state.intended.clear();
        abandoned
    }

    fn report(&mut self, abandoned: u64) -> ConnectionReport {
        ConnectionReport {
            connection: self.id,
            overflow: self.recorder.overflow(),
            buckets: self.recorder.take_buckets(),
            sent: self.state.sent,
            completed: self.state.completed,
            errors: self.state.errors,
            abandoned,
            lost: self.state.lost,
        }
    }
}
