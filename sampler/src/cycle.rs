//! Per-host collection cycle.
//!
//! One [`HostCycle`] runs per monitored host on its own task:
//!
//! ```text
//! Connecting --connected--> Sampling --connection lost--> Connecting
//!     |                        |
//!     +--attempts exhausted----+--cancelled--> Terminated
//! ```
//!
//! While sampling, every tick spawns one sampler per metric kind against the
//! shared connection. Each metric reports on its own FIFO channel and the
//! cycle waits on all of them at once, applying whatever arrives first.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::backoff::Backoff;
use crate::collectors::{Commands, MetricKind};
use crate::config::HostTarget;
use crate::error::SampleError;
use crate::events::{EventHub, HostEvent};
use crate::sampler::{self, SampleReport};
use crate::transport::{Connection, Connector};

/// Reports buffered per metric before samplers wait on the cycle.
const METRIC_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Connecting,
    Sampling,
    Terminated,
}

/// Timing and command settings shared by every host cycle.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive connection failures before giving up; `None` retries forever.
    pub max_connect_attempts: Option<u32>,
    pub commands: Commands,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_connect_attempts: None,
            commands: Commands::default(),
        }
    }
}

/// How a sampling session on one connection ended.
enum SessionEnd {
    Cancelled,
    ConnectionLost(SampleError),
}

/// Sender and receiver of every metric's report channel.
struct MetricChannels {
    cpu: (mpsc::Sender<SampleReport>, mpsc::Receiver<SampleReport>),
    memory: (mpsc::Sender<SampleReport>, mpsc::Receiver<SampleReport>),
    load_average: (mpsc::Sender<SampleReport>, mpsc::Receiver<SampleReport>),
    network: (mpsc::Sender<SampleReport>, mpsc::Receiver<SampleReport>),
    disk: (mpsc::Sender<SampleReport>, mpsc::Receiver<SampleReport>),
}

impl MetricChannels {
    fn new() -> Self {
        Self {
            cpu: mpsc::channel(METRIC_CHANNEL_CAPACITY),
            memory: mpsc::channel(METRIC_CHANNEL_CAPACITY),
            load_average: mpsc::channel(METRIC_CHANNEL_CAPACITY),
            network: mpsc::channel(METRIC_CHANNEL_CAPACITY),
            disk: mpsc::channel(METRIC_CHANNEL_CAPACITY),
        }
    }

    fn sender(&self, kind: MetricKind) -> mpsc::Sender<SampleReport> {
        match kind {
            MetricKind::Cpu => self.cpu.0.clone(),
            MetricKind::Memory => self.memory.0.clone(),
            MetricKind::LoadAverage => self.load_average.0.clone(),
            MetricKind::Network => self.network.0.clone(),
            MetricKind::Disk => self.disk.0.clone(),
        }
    }
}

/// The collection cycle of one host.
pub struct HostCycle {
    target: HostTarget,
    host: Arc<str>,
    connector: Arc<dyn Connector>,
    settings: CycleSettings,
    events: Arc<EventHub>,
}

impl HostCycle {
    pub fn new(
        target: HostTarget,
        connector: Arc<dyn Connector>,
        settings: CycleSettings,
        events: Arc<EventHub>,
    ) -> Self {
        let host = Arc::from(target.display_name());
        Self {
            target,
            host,
            connector,
            settings,
            events,
        }
    }

    /// Run until `cancel` fires or the connection attempt budget is spent.
    ///
    /// Returns the aggregator with the last known statistics. Failures never
    /// escape this host: they are logged and published as events.
    pub async fn run(self, cancel: CancellationToken) -> Aggregator {
        let mut aggregator = Aggregator::new(&*self.host);
        let mut backoff = Backoff::new(
            self.settings.backoff_initial,
            self.settings.backoff_max,
            self.settings.max_connect_attempts,
        );

        info!(host = %self.host, target = ?self.target, "Host cycle started");

        loop {
            self.set_state(CycleState::Connecting);

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.connector.connect(&self.target) => res,
            };

            let delay = match connected {
                Ok(connection) => {
                    backoff.on_success();
                    self.set_state(CycleState::Sampling);
                    let end = self.sample(&connection, &mut aggregator, &cancel).await;
                    connection.close().await;
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::ConnectionLost(e) => {
                            warn!(host = %self.host, error = %e, "Connection lost");
                            // Only failed connects count against the attempt budget.
                            self.settings.backoff_initial
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        host = %self.host,
                        attempt = backoff.failures() + 1,
                        error = %e,
                        "Connection failed"
                    );
                    let Some(delay) = backoff.on_failure() else {
                        error!(
                            host = %self.host,
                            attempts = backoff.failures(),
                            "Giving up on host after repeated connection failures"
                        );
                        break;
                    };
                    delay
                }
            };

            info!(host = %self.host, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(CycleState::Terminated);
        info!(host = %self.host, "Host cycle stopped");
        aggregator
    }

    /// Sample on every tick until cancelled or the connection drops.
    async fn sample(
        &self,
        connection: &Arc<dyn Connection>,
        aggregator: &mut Aggregator,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut channels = MetricChannels::new();
        let mut in_flight = JoinSet::new();
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end = loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                _ = ticker.tick() => {
                    self.spawn_samplers(connection, &channels, &mut in_flight);
                    self.events.publish(HostEvent::Snapshot {
                        host: self.host.clone(),
                        statistics: aggregator.snapshot().clone(),
                    });
                    continue;
                }
                Some(report) = channels.cpu.1.recv() => report,
                Some(report) = channels.memory.1.recv() => report,
                Some(report) = channels.load_average.1.recv() => report,
                Some(report) = channels.network.1.recv() => report,
                Some(report) = channels.disk.1.recv() => report,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(host = %self.host, "Sampler task panicked: {e}");
                        }
                    }
                    continue;
                }
            };

            let mut lost = None;
            if let Err(e) = &report.outcome {
                warn!(host = %self.host, metric = %report.kind, error = %e, "Sample unavailable");
                self.events.publish(HostEvent::SampleFailed {
                    host: self.host.clone(),
                    kind: report.kind,
                    error: e.clone(),
                });
                lost = e.is_connection_lost().then(|| e.clone());
            }
            aggregator.apply(report);

            if let Some(e) = lost {
                break SessionEnd::ConnectionLost(e);
            }
        };

        // Abandon whatever is still running on this connection.
        in_flight.shutdown().await;
        end
    }

    fn spawn_samplers(
        &self,
        connection: &Arc<dyn Connection>,
        channels: &MetricChannels,
        in_flight: &mut JoinSet<()>,
    ) {
        debug!(host = %self.host, in_flight = in_flight.len(), "Tick");
        for kind in MetricKind::ALL {
            in_flight.spawn(sampler::deliver(
                Arc::clone(connection),
                kind,
                self.settings.commands.for_kind(kind).to_string(),
                self.host.clone(),
                channels.sender(kind),
            ));
        }
    }

    fn set_state(&self, state: CycleState) {
        debug!(host = %self.host, ?state, "Cycle state");
        self.events.publish(HostEvent::StateChanged {
            host: self.host.clone(),
            state,
        });
    }
}
