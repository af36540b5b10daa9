use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::MetricKind;
use crate::error::ParseError;

pub const COMMAND: &str = "cat /proc/meminfo";

// Anchored so that `SwapCached:` never satisfies `Cached:`.
static MEM_TOTAL: LazyLock<Regex> = LazyLock::new(|| field_regex("MemTotal"));
static MEM_FREE: LazyLock<Regex> = LazyLock::new(|| field_regex("MemFree"));
static BUFFERS: LazyLock<Regex> = LazyLock::new(|| field_regex("Buffers"));
static CACHED: LazyLock<Regex> = LazyLock::new(|| field_regex("Cached"));

fn field_regex(key: &str) -> Regex {
    Regex::new(&format!(r"(?m)^{key}:[ \t]*(\S+)")).expect("valid meminfo regex")
}

/// Memory usage information, all values in KB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub total_kb: u64,
    pub free_kb: u64,
    pub buffers_kb: u64,
    pub cached_kb: u64,
}

impl MemorySample {
    /// Memory in use by processes: total minus free, buffers and page cache.
    ///
    /// `None` when the reclaimable parts exceed the total.
    pub fn used_kb(&self) -> Option<u64> {
        let reclaimable = self
            .free_kb
            .checked_add(self.buffers_kb)?
            .checked_add(self.cached_kb)?;
        self.total_kb.checked_sub(reclaimable)
    }

    pub fn used_percent(&self) -> Option<f64> {
        if self.total_kb == 0 {
            return None;
        }
        self.used_kb()
            .map(|used| used as f64 * 100.0 / self.total_kb as f64)
    }
}

/// Parse a `/proc/meminfo` listing.
pub fn parse(text: &str) -> Result<MemorySample, ParseError> {
    let sample = MemorySample {
        total_kb: field(&MEM_TOTAL, text, "MemTotal")?,
        free_kb: field(&MEM_FREE, text, "MemFree")?,
        buffers_kb: field(&BUFFERS, text, "Buffers")?,
        cached_kb: field(&CACHED, text, "Cached")?,
    };

    if sample.used_kb().is_none() {
        return Err(ParseError::Inconsistent {
            kind: MetricKind::Memory,
            reason: format!(
                "free + buffers + cached exceeds MemTotal ({} kB)",
                sample.total_kb
            ),
        });
    }

    Ok(sample)
}

fn field(re: &Regex, text: &str, name: &'static str) -> Result<u64, ParseError> {
    let caps = re
        .captures(text)
        .ok_or(ParseError::NoMatch { kind: MetricKind::Memory })?;
    caps[1]
        .parse()
        .map_err(|_| ParseError::invalid_number(name, &caps[1]))
}
