//! Per-host snapshot aggregation.
//!
//! The [`Aggregator`] applies sample reports in whatever order they arrive.
//! Its [`ServerStatistics`] is therefore a composite of the latest result per
//! metric, possibly taken on different ticks: it is never a point-in-time
//! consistent view across metrics.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collectors::{
    network, CpuSample, DiskSample, InterfaceRate, LoadAverageSample, MemorySample, Metric,
    MetricKind, NetworkSample,
};
use crate::error::SampleError;
use crate::sampler::SampleReport;

/// Latest knowledge about one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reading<T> {
    /// No report received yet.
    Pending,
    Available { value: T },
    Unavailable { reason: String },
}

impl<T> Reading<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Reading::Available { value } => Some(value),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Reading::Available { .. })
    }

    fn unavailable(reason: impl ToString) -> Self {
        Reading::Unavailable {
            reason: reason.to_string(),
        }
    }
}

impl<T> Default for Reading<T> {
    fn default() -> Self {
        Reading::Pending
    }
}

/// Current statistics of one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStatistics {
    pub host: String,
    pub cpu: Reading<CpuSample>,
    /// Busy share of CPU time since the previous CPU sample, in percent.
    pub cpu_utilization: Reading<f64>,
    pub memory: Reading<MemorySample>,
    pub load_average: Reading<LoadAverageSample>,
    pub network: Reading<NetworkSample>,
    /// Throughput since the previous network sample; empty until two exist.
    pub network_rates: Vec<InterfaceRate>,
    pub disk: Reading<DiskSample>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Derives CPU utilization from consecutive cumulative tick counters.
#[derive(Debug, Default)]
pub struct CpuTracker {
    previous: Option<CpuSample>,
}

impl CpuTracker {
    /// Record `sample` as the new baseline and return the utilization since
    /// the old one.
    ///
    /// `None` when there is no baseline yet, when the total did not advance
    /// (duplicate sample or reboot), or when the result falls outside
    /// [0, 100] (counter reset). The baseline moves to `sample` regardless.
    pub fn observe(&mut self, sample: CpuSample) -> Option<f64> {
        let previous = self.previous.replace(sample)?;

        let total_delta = sample.total_ticks - previous.total_ticks;
        if total_delta <= 0.0 {
            return None;
        }
        let idle_delta = sample.idle_ticks - previous.idle_ticks;
        let utilization = 100.0 - (idle_delta * 100.0 / total_delta);

        (0.0..=100.0).contains(&utilization).then_some(utilization)
    }

    pub fn baseline(&self) -> Option<CpuSample> {
        self.previous
    }
}

/// Owns one host's [`ServerStatistics`] and the CPU baseline.
#[derive(Debug)]
pub struct Aggregator {
    stats: ServerStatistics,
    cpu: CpuTracker,
}

impl Aggregator {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            stats: ServerStatistics {
                host: host.into(),
                ..Default::default()
            },
            cpu: CpuTracker::default(),
        }
    }

    pub fn snapshot(&self) -> &ServerStatistics {
        &self.stats
    }

    pub fn cpu_baseline(&self) -> Option<CpuSample> {
        self.cpu.baseline()
    }

    /// Merge one report into the snapshot.
    pub fn apply(&mut self, report: SampleReport) {
        self.apply_at(report, Utc::now());
    }

    pub fn apply_at(&mut self, report: SampleReport, now: DateTime<Utc>) {
        match report.outcome {
            Ok(metric) => self.apply_metric(metric),
            Err(error) => self.mark_unavailable(report.kind, &error),
        }
        self.stats.updated_at = Some(now);
    }

    fn apply_metric(&mut self, metric: Metric) {
        match metric {
            Metric::Cpu(sample) => self.apply_cpu(sample),
            Metric::Memory(sample) => self.stats.memory = Reading::Available { value: sample },
            Metric::LoadAverage(sample) => {
                self.stats.load_average = Reading::Available { value: sample }
            }
            Metric::Network(sample) => {
                self.stats.network_rates = match self.stats.network.value() {
                    Some(previous) => network::rates(previous, &sample),
                    None => Vec::new(),
                };
                self.stats.network = Reading::Available { value: sample };
            }
            Metric::Disk(sample) => self.stats.disk = Reading::Available { value: sample },
        }
    }

    fn apply_cpu(&mut self, sample: CpuSample) {
        if !(sample.total_ticks > 0.0 && sample.idle_ticks > 0.0) {
            self.stats.cpu = Reading::unavailable("cpu counters are not positive");
            self.stats.cpu_utilization = Reading::unavailable("cpu sample unavailable");
            return;
        }

        self.stats.cpu_utilization = match self.cpu.observe(sample) {
            Some(percent) => Reading::Available { value: percent },
            None => Reading::unavailable("no usable cpu baseline"),
        };
        self.stats.cpu = Reading::Available { value: sample };
    }

    fn mark_unavailable(&mut self, kind: MetricKind, error: &SampleError) {
        match kind {
            MetricKind::Cpu => {
                self.stats.cpu = Reading::unavailable(error);
                self.stats.cpu_utilization = Reading::unavailable("cpu sample unavailable");
            }
            MetricKind::Memory => self.stats.memory = Reading::unavailable(error),
            MetricKind::LoadAverage => self.stats.load_average = Reading::unavailable(error),
            MetricKind::Network => {
                self.stats.network = Reading::unavailable(error);
                self.stats.network_rates.clear();
            }
            MetricKind::Disk => self.stats.disk = Reading::unavailable(error),
        }
    }
}

/// Human readable size of `kb` kilobytes: GB above 1,048,576 KB, MB above
/// 1024 KB, KB otherwise.
pub fn memory_to_text(kb: f64) -> String {
    if kb > 1_048_576.0 {
        format!("{:.1} GB", kb / 1024.0 / 1024.0)
    } else if kb > 1024.0 {
        format!("{:.1} MB", kb / 1024.0)
    } else {
        format!("{kb:.1} KB")
    }
}

/// Used memory of `sample` as text, if it is consistent.
pub fn used_memory_text(sample: &MemorySample) -> Option<String> {
    sample.used_kb().map(|kb| memory_to_text(kb as f64))
}
