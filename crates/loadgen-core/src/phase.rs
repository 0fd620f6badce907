use crate::config::{BenchmarkConfig, HistogramConfig};
use crate::driver::{ConnectionDriver, ConnectionReport, PhaseStart};
use crate::error::LoadError;
use crate::stats::StatisticPhase;
use crate::transport::Transport;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{info, warn};

pub const WARM_UP: &str = "warm-up";
pub const MEASUREMENT: &str = "test";

/// Receives every finished phase, e.g. to print or persist it.
pub trait PhaseConsumer: Send {
    fn accept(&mut self, phase: &StatisticPhase);
}

impl<F> PhaseConsumer for F
where
    F: FnMut(&StatisticPhase) + Send,
{
    fn accept(&mut self, phase: &StatisticPhase) {
        self(phase)
    }
}

/// Ask a driver to run one phase and answer with its report.
struct PhaseCommand {
    phase: PhaseStart,
    stop: watch::Receiver<bool>,
    reply: oneshot::Sender<Result<ConnectionReport, LoadError>>,
}

struct DriverHandle {
    commands: mpsc::Sender<PhaseCommand>,
    task: JoinHandle<()>,
}

/// Each driver lives on its own task for the whole benchmark. Dropping the
/// command sender closes its connection.
fn spawn_driver(mut driver: ConnectionDriver) -> DriverHandle {
    let (commands, mut rx) = mpsc::channel::<PhaseCommand>(1);
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let report = driver.run_phase(&command.phase, command.stop).await;
            let _ = command.reply.send(report);
        }
        driver.close();
    });
    DriverHandle { commands, task }
}

/// Runs warm-up and measurement phases over a fixed set of connections.
pub struct Benchmark {
    config: BenchmarkConfig,
    histogram: HistogramConfig,
    transport: Arc<dyn Transport>,
}

impl Benchmark {
    pub fn new(
        config: BenchmarkConfig,
        histogram: HistogramConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, LoadError> {
        config.validate()?;
        histogram.validate()?;
        if config.rate == 0.0 && config.pacing.is_rate_based() {
            warn!(
                pacing = %config.pacing,
                "rate is 0, falling back to the closed model"
            );
        }
        Ok(Self {
            config,
            histogram,
            transport,
        })
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Phases in execution order.
    pub fn phases(&self) -> Vec<(&'static str, Duration)> {
        let mut phases = Vec::with_capacity(2);
        if let Some(warm_up) = self.config.warm_up() {
            phases.push((WARM_UP, warm_up));
        }
        phases.push((MEASUREMENT, self.config.duration()));
        phases
    }

    /// Open every connection. Either all of them open or none stays open.
    pub async fn open(&self) -> Result<Vec<ConnectionDriver>, LoadError> {
        let url = self.config.target()?;
        let opened = join_all((0..self.config.connections).map(|_| self.transport.open(&url))).await;

        let mut connections = Vec::with_capacity(opened.len());
        let mut failure = None;
        for (index, result) in opened.into_iter().enumerate() {
            match result {
                Ok(connection) => connections.push(connection),
                Err(source) if failure.is_none() => {
                    failure = Some(LoadError::Connect { index, source })
                }
                Err(_) => {}
            }
        }
        if let Some(err) = failure {
            warn!(
                opened = connections.len(),
                wanted = self.config.connections,
                "Could not open all connections, closing the rest"
            );
            for mut connection in connections {
                connection.close();
            }
            return Err(err);
        }

        info!(
            connections = connections.len(),
            transport = self.transport.name(),
            pacing = %self.config.effective_pacing(),
            "Connections open"
        );
        connections
            .into_iter()
            .enumerate()
            .map(|(id, connection)| {
                ConnectionDriver::new(id, connection, &self.config, self.histogram)
            })
            .collect()
    }

    /// Run all phases, handing each finished one to `consumer`.
    pub async fn run(
        &self,
        consumer: &mut dyn PhaseConsumer,
    ) -> Result<Vec<StatisticPhase>, LoadError> {
        let drivers = self.open().await?;
        let handles: Vec<DriverHandle> = drivers.into_iter().map(spawn_driver).collect();

        let mut phases = Vec::new();
        let mut outcome = Ok(());
        for (name, duration) in self.phases() {
            match self.run_phase(&handles, name, duration).await {
                Ok(phase) => {
                    consumer.accept(&phase);
                    phases.push(phase);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        shutdown(handles).await;
        outcome.map(|_| phases)
    }

    async fn run_phase(
        &self,
        handles: &[DriverHandle],
        name: &str,
        duration: Duration,
    ) -> Result<StatisticPhase, LoadError> {
        let phase = PhaseStart::now(name, duration);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut replies = Vec::with_capacity(handles.len());
        for handle in handles {
            let (reply, rx) = oneshot::channel();
            let command = PhaseCommand {
                phase: phase.clone(),
                stop: stop_rx.clone(),
                reply,
            };
            handle
                .commands
                .send(command)
                .await
                .map_err(|_| LoadError::Driver("driver task is gone".to_string()))?;
            replies.push(rx);
        }
        info!(
            phase = name,
            duration_secs = duration.as_secs_f64(),
            "Phase started"
        );

        sleep_until(phase.start + duration).await;
        let _ = stop_tx.send(true);
        let elapsed = phase.start.elapsed();

        let mut reports = Vec::with_capacity(replies.len());
        for rx in replies {
            let report = rx
                .await
                .map_err(|_| LoadError::Driver("driver task ended mid-phase".to_string()))??;
            reports.push(report);
        }
        log_reports(name, &reports);

        StatisticPhase::from_reports(name, phase.started_at, elapsed, &self.histogram, &reports)
    }
}

async fn shutdown(handles: Vec<DriverHandle>) {
    let tasks: Vec<JoinHandle<()>> = handles
        .into_iter()
        .map(|DriverHandle { commands, task }| {
            drop(commands);
            task
        })
        .collect();
    for result in join_all(tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "Driver task failed");
        }
    }
}

fn log_reports(name: &str, reports: &[ConnectionReport]) {
    let sent: u64 = reports.iter().map(|r| r.sent).sum();
    let completed: u64 = reports.iter().map(|r| r.completed).sum();
    let errors: u64 = reports.iter().map(|r| r.errors).sum();
    let abandoned: u64 = reports.iter().map(|r| r.abandoned).sum();
    let overflow: u64 = reports.iter().map(|r| r.overflow).sum();
    let lost = reports.iter().filter(|r| r.lost).count();

    info!(
        phase = name,
        sent, completed, errors, abandoned, overflow, "Phase stopped"
    );
    if lost > 0 {
        warn!(
            phase = name,
            lost,
            connections = reports.len(),
            "Connections lost mid-phase"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::PacingModel;
    use crate::transport::MockTransport;

    fn config(connections: usize) -> BenchmarkConfig {
        BenchmarkConfig {
            threads: 1,
            connections,
            url: "http://localhost:8080/".to_string(),
            duration_secs: 2,
            warm_up_secs: 1,
            rate: 50.0,
            timeout_ms: None,
            pacing: PacingModel::FixedRate,
            seed: 0,
            tasks: Vec::new(),
            drain_timeout_ms: 100,
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let transport = Arc::new(MockTransport::default());
        let mut bad = config(1);
        bad.connections = 0;
        assert!(matches!(
            Benchmark::new(bad, HistogramConfig::default(), transport),
            Err(LoadError::Config(_))
        ));
    }

    #[test]
    fn test_phase_order() {
        let transport = Arc::new(MockTransport::default());
        let bench = Benchmark::new(config(1), HistogramConfig::default(), transport).unwrap();
        let phases = bench.phases();
        assert_eq!(phases[0], (WARM_UP, Duration::from_secs(1)));
        assert_eq!(phases[1], (MEASUREMENT, Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_partial_open_closes_everything() {
        let transport = MockTransport::new(Duration::ZERO).with_open_limit(3);
        let bench =
            Benchmark::new(config(5), HistogramConfig::default(), Arc::new(transport.clone()))
                .unwrap();

        let err = bench.open().await.err().unwrap();
        assert!(matches!(err, LoadError::Connect { .. }));
        assert_eq!(transport.opened(), 3);
        assert_eq!(transport.closed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_both_phases() {
        let transport = MockTransport::new(Duration::from_millis(2));
        let bench =
            Benchmark::new(config(3), HistogramConfig::default(), Arc::new(transport.clone()))
                .unwrap();

        let mut seen = Vec::new();
        let mut consumer = |phase: &StatisticPhase| seen.push(phase.name.clone());
        let phases = bench.run(&mut consumer).await.unwrap();

        assert_eq!(seen, vec![WARM_UP.to_string(), MEASUREMENT.to_string()]);
        assert_eq!(phases[0].ticks.len(), 1);
        assert_eq!(phases[1].ticks.len(), 2);
        assert_eq!(phases[1].connections, 3);
        // 3 connections x 50 req/s x 2 s, give or take the boundary request.
        let total = phases[1].total_requests();
        assert!((300..=303).contains(&total), "total: {}", total);
        assert_eq!(transport.closed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_keeps_phase_length() {
        let transport = MockTransport::new(Duration::from_millis(1)).with_disconnect_after(10);
        let mut cfg = config(2);
        cfg.warm_up_secs = 0;
        cfg.pacing = PacingModel::SemiOpen;
        let bench = Benchmark::new(cfg, HistogramConfig::default(), Arc::new(transport)).unwrap();

        let mut ignore = |_: &StatisticPhase| {};
        let phases = bench.run(&mut ignore).await.unwrap();
        let test = &phases[0];

        assert_eq!(test.lost_connections, 2);
        assert_eq!(test.ticks.len(), 2);
        assert_eq!(test.ticks[1].requests, 0);
        assert_eq!(test.total_requests(), 20);
        assert_eq!(test.total_errors(), 2);
    }
}
