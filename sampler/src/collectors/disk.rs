use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::MetricKind;
use crate::error::ParseError;

/// `size used available NN%` column run of a `df` row.
static DF_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+(\d+)\s+(\d+)\s+(\d+)%").expect("valid df regex"));

/// Disk usage information for a single mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSample {
    pub size_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
    pub used_percent: u32,
}

/// `df` invocation for `mount`, in POSIX format with 1K blocks so long
/// device names never wrap a row.
pub fn command(mount: &str) -> String {
    format!("df -P -k {}", shell_quote(mount))
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

pub fn parse(text: &str) -> Result<DiskSample, ParseError> {
    let caps = DF_ROW
        .captures(text)
        .ok_or(ParseError::NoMatch { kind: MetricKind::Disk })?;

    Ok(DiskSample {
        size_kb: number(&caps[1], "size_kb")?,
        used_kb: number(&caps[2], "used_kb")?,
        available_kb: number(&caps[3], "available_kb")?,
        used_percent: number(&caps[4], "used_percent")?,
    })
}

fn number<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, ParseError> {
    value
        .parse()
        .map_err(|_| ParseError::invalid_number(field, value))
}
