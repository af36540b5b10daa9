use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::MetricKind;
use crate::error::ParseError;

/// Remote command producing the system-wide tick counters.
pub const COMMAND: &str = "cat /proc/stat";

/// Aggregate `cpu` line of `/proc/stat`: the counters after the label.
static CPU_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^cpu[ \t]+([0-9 \t]+?)[ \t\r]*$").expect("valid cpu regex"));

/// Counters that make up the total. `guest` and `guest_nice` (fields 9 and 10
/// on newer kernels) are already folded into `user` and `nice`.
const TOTAL_FIELDS: usize = 8;

/// Oldest kernels expose only user, nice, system and idle.
const MIN_FIELDS: usize = 4;

/// Cumulative CPU tick counters since boot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuSample {
    pub total_ticks: f64,
    pub idle_ticks: f64,
}

/// Parse the aggregate `cpu` line of a `/proc/stat` dump.
pub fn parse(text: &str) -> Result<CpuSample, ParseError> {
    let caps = CPU_LINE
        .captures(text)
        .ok_or(ParseError::NoMatch { kind: MetricKind::Cpu })?;

    let fields = caps[1]
        .split_whitespace()
        .map(|v| v.parse::<u64>().map_err(|_| ParseError::invalid_number("cpu", v)))
        .collect::<Result<Vec<_>, _>>()?;

    if fields.len() < MIN_FIELDS {
        return Err(ParseError::NoMatch { kind: MetricKind::Cpu });
    }

    let total = fields
        .iter()
        .take(TOTAL_FIELDS)
        .try_fold(0u64, |acc, v| acc.checked_add(*v))
        .ok_or_else(|| ParseError::invalid_number("cpu", caps[1].trim()))?;

    Ok(CpuSample {
        total_ticks: total as f64,
        idle_ticks: fields[3] as f64,
    })
}
