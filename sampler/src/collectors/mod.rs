//! Metric kinds, the remote command behind each, and the parsers that turn
//! raw command output into typed samples.
//!
//! Parsers are pure: no I/O, no shared mutable state. Every pattern is a
//! compiled-once static owned by its module.

pub mod cpu;
pub mod disk;
pub mod load;
pub mod memory;
pub mod network;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ParseError;

pub use cpu::CpuSample;
pub use disk::DiskSample;
pub use load::LoadAverageSample;
pub use memory::MemorySample;
pub use network::{InterfaceCounters, InterfaceRate, NetworkSample};

/// The fixed battery of metrics sampled on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    LoadAverage,
    Network,
    Disk,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::LoadAverage,
        MetricKind::Network,
        MetricKind::Disk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::LoadAverage => "load_average",
            MetricKind::Network => "network",
            MetricKind::Disk => "disk",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One successfully parsed sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Metric {
    Cpu(CpuSample),
    Memory(MemorySample),
    LoadAverage(LoadAverageSample),
    Network(NetworkSample),
    Disk(DiskSample),
}

impl Metric {
    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Cpu(_) => MetricKind::Cpu,
            Metric::Memory(_) => MetricKind::Memory,
            Metric::LoadAverage(_) => MetricKind::LoadAverage,
            Metric::Network(_) => MetricKind::Network,
            Metric::Disk(_) => MetricKind::Disk,
        }
    }
}

/// Remote command strings, one per metric kind.
#[derive(Debug, Clone)]
pub struct Commands {
    disk: String,
}

impl Commands {
    /// Commands sampling disk usage of `disk_mount`.
    pub fn new(disk_mount: &str) -> Self {
        Self {
            disk: disk::command(disk_mount),
        }
    }

    pub fn for_kind(&self, kind: MetricKind) -> &str {
        match kind {
            MetricKind::Cpu => cpu::COMMAND,
            MetricKind::Memory => memory::COMMAND,
            MetricKind::LoadAverage => load::COMMAND,
            MetricKind::Network => network::COMMAND,
            MetricKind::Disk => &self.disk,
        }
    }
}

impl Default for Commands {
    fn default() -> Self {
        Self::new("/")
    }
}

/// Parse raw output of the command for `kind`, stamping time-based samples
/// with the current time.
pub fn parse(kind: MetricKind, raw: &[u8]) -> Result<Metric, ParseError> {
    parse_at(kind, raw, Utc::now())
}

/// Like [`parse`], with an explicit observation time.
pub fn parse_at(kind: MetricKind, raw: &[u8], now: DateTime<Utc>) -> Result<Metric, ParseError> {
    let text = String::from_utf8_lossy(raw);
    let metric = match kind {
        MetricKind::Cpu => Metric::Cpu(cpu::parse(&text)?),
        MetricKind::Memory => Metric::Memory(memory::parse(&text)?),
        MetricKind::LoadAverage => Metric::LoadAverage(load::parse(&text)?),
        MetricKind::Network => Metric::Network(network::parse(&text, now)?),
        MetricKind::Disk => Metric::Disk(disk::parse(&text)?),
    };
    Ok(metric)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_to_the_matching_parser() {
        let metric = parse(MetricKind::Disk, b"/dev/vda1 100 40 60 40% /\n").unwrap();
        assert_eq!(metric.kind(), MetricKind::Disk);
        assert!(matches!(metric, Metric::Disk(DiskSample { used_percent: 40, .. })));
    }

    #[test]
    fn every_kind_reports_no_match_on_empty_output() {
        for kind in MetricKind::ALL {
            let err = parse(kind, b"").unwrap_err();
            assert_eq!(err, ParseError::NoMatch { kind }, "{kind}");
        }
    }

    #[test]
    fn all_zero_output_is_a_real_sample() {
        let metric = parse(MetricKind::Disk, b"0 0 0 0%").unwrap();
        assert_eq!(
            metric,
            Metric::Disk(DiskSample {
                size_kb: 0,
                used_kb: 0,
                available_kb: 0,
                used_percent: 0,
            })
        );
    }

    #[test]
    fn non_utf8_output_does_not_panic() {
        for kind in MetricKind::ALL {
            assert!(parse(kind, &[0xff, 0xfe, 0x00, 0x80]).is_err());
        }
    }

    #[test]
    fn disk_command_follows_configured_mount() {
        let commands = Commands::new("/data");
        assert_eq!(commands.for_kind(MetricKind::Disk), "df -P -k '/data'");
        assert_eq!(commands.for_kind(MetricKind::Cpu), "cat /proc/stat");
    }
}
