//! Error types shared by the transport, parsers and samplers.
//!
//! Every variant is `Clone` so failures can ride along in broadcast events.

use std::time::Duration;

use thiserror::Error;

use crate::collectors::MetricKind;

/// Failure reported by a [`Connector`](crate::transport::Connector) or
/// [`Connection`](crate::transport::Connection).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection to the host could not be established.
    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    /// An established connection went away.
    #[error("connection lost: {reason}")]
    Disconnected { reason: String },

    /// One command ran but did not succeed.
    #[error("command `{command}` failed (status {status:?}): {stderr}")]
    Execution {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// One command did not finish in time.
    #[error("command `{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// A local helper process could not be started.
    #[error("failed to start `{program}`: {reason}")]
    Spawn { program: String, reason: String },
}

impl TransportError {
    /// Whether the failure means the host connection itself is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::Disconnected { .. })
    }
}

/// Command output did not have the shape a parser expects.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{kind} output did not match the expected layout")]
    NoMatch { kind: MetricKind },

    #[error("field `{field}` is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("inconsistent {kind} sample: {reason}")]
    Inconsistent { kind: MetricKind, reason: String },
}

impl ParseError {
    pub(crate) fn invalid_number(field: &'static str, value: &str) -> Self {
        Self::InvalidNumber {
            field,
            value: value.to_string(),
        }
    }
}

/// Why a single metric sample is unavailable for a tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl SampleError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, SampleError::Transport(e) if e.is_connection_lost())
    }
}
