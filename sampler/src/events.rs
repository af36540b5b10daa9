use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::aggregator::ServerStatistics;
use crate::collectors::MetricKind;
use crate::cycle::CycleState;
use crate::error::SampleError;

/// Something a host cycle wants presentation or logging to know about.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Current statistics, published once per tick.
    Snapshot {
        host: Arc<str>,
        statistics: ServerStatistics,
    },
    /// One metric could not be sampled this tick.
    SampleFailed {
        host: Arc<str>,
        kind: MetricKind,
        error: SampleError,
    },
    StateChanged {
        host: Arc<str>,
        state: CycleState,
    },
}

impl HostEvent {
    pub fn host(&self) -> &str {
        match self {
            HostEvent::Snapshot { host, .. }
            | HostEvent::SampleFailed { host, .. }
            | HostEvent::StateChanged { host, .. } => host.as_ref(),
        }
    }
}

/// Wire shape of a failure for JSON output.
#[derive(Debug, Serialize)]
pub struct FailureRecord<'a> {
    pub host: &'a str,
    pub kind: MetricKind,
    pub error: String,
}

/// Fan-out of [`HostEvent`]s from every host cycle to any number of observers.
pub struct EventHub {
    tx: broadcast::Sender<HostEvent>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: HostEvent) {
        // Ignore error (no observers subscribed).
        let _ = self.tx.send(event);
    }
}
