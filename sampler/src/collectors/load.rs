use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::MetricKind;
use crate::error::ParseError;

pub const COMMAND: &str = "uptime";

/// Trailing clause of `uptime`: `load average: 0.15, 0.10, 0.05` on Linux,
/// `load averages: 1.52 1.61 1.70` on BSD and macOS.
static LOAD_AVERAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"load averages?:\s*([^\n]*)").expect("valid uptime regex"));

/// Load averages reported by `uptime`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadAverageSample {
    pub one: f64,
    pub five: Option<f64>,
    pub fifteen: Option<f64>,
}

pub fn parse(text: &str) -> Result<LoadAverageSample, ParseError> {
    let caps = LOAD_AVERAGE
        .captures(text)
        .ok_or(ParseError::NoMatch { kind: MetricKind::LoadAverage })?;

    let mut figures = caps[1]
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty());

    let one = figures
        .next()
        .ok_or(ParseError::NoMatch { kind: MetricKind::LoadAverage })?;
    let one = figure(one).ok_or_else(|| ParseError::invalid_number("load_average", one))?;

    // Only the 1-minute figure is required; a malformed longer window is dropped.
    let five = figures.next().and_then(figure);
    let fifteen = figures.next().and_then(figure);

    Ok(LoadAverageSample { one, five, fifteen })
}

fn figure(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}
