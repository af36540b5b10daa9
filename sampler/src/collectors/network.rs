use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use super::MetricKind;
use crate::error::ParseError;

pub const COMMAND: &str = "cat /proc/net/dev";

/// `  eth0: <16 counters>`; the two header rows carry no colon.
static INTERFACE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*([^\s:|]+):[ \t]*([^\n]*)$").expect("valid net/dev regex"));

const RX_BYTES: usize = 0;
const TX_BYTES: usize = 8;

/// Byte counters for one network interface, cumulative since boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// All interfaces listed by the host at `sampled_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSample {
    pub interfaces: Vec<InterfaceCounters>,
    pub sampled_at: DateTime<Utc>,
}

impl NetworkSample {
    pub fn interface(&self, name: &str) -> Option<&InterfaceCounters> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

/// Throughput of one interface between two consecutive samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceRate {
    pub name: String,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

/// Parse a `/proc/net/dev` listing observed at `sampled_at`.
pub fn parse(text: &str, sampled_at: DateTime<Utc>) -> Result<NetworkSample, ParseError> {
    let mut interfaces = Vec::new();

    for caps in INTERFACE_LINE.captures_iter(text) {
        let counters: Vec<&str> = caps[2].split_whitespace().collect();
        if counters.len() <= TX_BYTES {
            continue;
        }

        interfaces.push(InterfaceCounters {
            name: caps[1].to_string(),
            rx_bytes: counter(counters[RX_BYTES], "rx_bytes")?,
            tx_bytes: counter(counters[TX_BYTES], "tx_bytes")?,
        });
    }

    if interfaces.is_empty() {
        return Err(ParseError::NoMatch { kind: MetricKind::Network });
    }

    Ok(NetworkSample {
        interfaces,
        sampled_at,
    })
}

fn counter(value: &str, field: &'static str) -> Result<u64, ParseError> {
    value
        .parse()
        .map_err(|_| ParseError::invalid_number(field, value))
}

/// Per-interface throughput between `previous` and `current`, matched by name.
///
/// Interfaces that are new, vanished, or whose counters went backwards
/// (driver reload, host reboot) get no rate.
pub fn rates(previous: &NetworkSample, current: &NetworkSample) -> Vec<InterfaceRate> {
    let elapsed = (current.sampled_at - previous.sampled_at).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return Vec::new();
    }

    current
        .interfaces
        .iter()
        .filter_map(|now| {
            let before = previous.interface(&now.name)?;
            let rx = now.rx_bytes.checked_sub(before.rx_bytes)?;
            let tx = now.tx_bytes.checked_sub(before.tx_bytes)?;
            Some(InterfaceRate {
                name: now.name.clone(),
                rx_bytes_per_sec: rx as f64 / elapsed,
                tx_bytes_per_sec: tx as f64 / elapsed,
            })
        })
        .collect()
}
