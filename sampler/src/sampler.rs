//! Remote sampler: one metric, one command, one execution context.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::collectors::{self, Metric, MetricKind};
use crate::error::SampleError;
use crate::transport::Connection;

/// Result of sampling one metric on one tick.
#[derive(Debug, Clone)]
pub struct SampleReport {
    pub kind: MetricKind,
    pub outcome: Result<Metric, SampleError>,
}

/// Run `command` on `connection` and parse its output as `kind`.
///
/// Transport and parse failures come back as errors; nothing here panics or
/// fabricates a zero-valued sample.
pub async fn sample(
    connection: &dyn Connection,
    kind: MetricKind,
    command: &str,
) -> Result<Metric, SampleError> {
    let raw = connection.execute(command).await?;
    Ok(collectors::parse(kind, &raw)?)
}

/// Sample `kind` and deliver the report on that metric's channel.
///
/// A closed channel means the host cycle stopped; the report is dropped.
pub async fn deliver(
    connection: Arc<dyn Connection>,
    kind: MetricKind,
    command: String,
    host: Arc<str>,
    tx: mpsc::Sender<SampleReport>,
) {
    let outcome = sample(connection.as_ref(), kind, &command).await;
    debug!(host = %host, metric = %kind, ok = outcome.is_ok(), "Sample finished");

    if tx.send(SampleReport { kind, outcome }).await.is_err() {
        debug!(host = %host, metric = %kind, "Host cycle gone, dropping sample");
    }
}
