//! Console presentation of host events: structured log lines by default,
//! JSON lines on stdout with `--json`.

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::aggregator::{memory_to_text, used_memory_text, Reading, ServerStatistics};
use crate::events::{FailureRecord, HostEvent};

const UNAVAILABLE: &str = "n/a";

/// One-line human summary of a host snapshot.
pub fn summary(stats: &ServerStatistics) -> String {
    let cpu = match &stats.cpu_utilization {
        Reading::Available { value } => format!("{value:.1}%"),
        _ => UNAVAILABLE.to_string(),
    };

    let memory = stats
        .memory
        .value()
        .and_then(|m| {
            let used = used_memory_text(m)?;
            Some(match m.used_percent() {
                Some(pct) => format!("{used} ({pct:.1}%)"),
                None => used,
            })
        })
        .unwrap_or_else(|| UNAVAILABLE.to_string());

    let load = stats
        .load_average
        .value()
        .map(|l| format!("{:.2}", l.one))
        .unwrap_or_else(|| UNAVAILABLE.to_string());

    let disk = stats
        .disk
        .value()
        .map(|d| format!("{}%", d.used_percent))
        .unwrap_or_else(|| UNAVAILABLE.to_string());

    let mut line = format!("cpu={cpu} mem={memory} load={load} disk={disk}");
    for rate in &stats.network_rates {
        line.push_str(&format!(
            " {}=rx {}/s tx {}/s",
            rate.name,
            memory_to_text(rate.rx_bytes_per_sec / 1024.0),
            memory_to_text(rate.tx_bytes_per_sec / 1024.0),
        ));
    }
    line
}

fn json_line(event: &HostEvent) -> Option<String> {
    let value = match event {
        HostEvent::Snapshot { statistics, .. } => serde_json::json!({
            "event": "snapshot",
            "statistics": statistics,
        }),
        HostEvent::SampleFailed { host, kind, error } => {
            let failure = FailureRecord {
                host: host.as_ref(),
                kind: *kind,
                error: error.to_string(),
            };
            serde_json::json!({
                "event": "sample_failed",
                "failure": failure,
            })
        }
        HostEvent::StateChanged { host, state } => serde_json::json!({
            "event": "state_changed",
            "host": &**host,
            "state": state,
        }),
    };
    serde_json::to_string(&value).ok()
}

/// Print events until every publisher is gone.
pub async fn print_events(mut rx: broadcast::Receiver<HostEvent>, json: bool) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer fell behind, dropped events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if json {
            if let Some(line) = json_line(&event) {
                println!("{line}");
            }
            continue;
        }

        match &event {
            HostEvent::Snapshot { host, statistics } => {
                info!(host = %host, "{}", summary(statistics));
            }
            HostEvent::StateChanged { host, state } => {
                info!(host = %host, ?state, "Host state changed");
            }
            // Already logged by the host cycle.
            HostEvent::SampleFailed { .. } => {}
        }
    }
}
