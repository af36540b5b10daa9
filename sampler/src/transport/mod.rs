//! Boundary to the remote command-execution transport.
//!
//! The sampling engine only ever sees these two traits: a [`Connector`] that
//! opens one long-lived [`Connection`] per host, and the connection's
//! `execute`, which runs one command in its own execution context.

pub mod openssh;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::HostTarget;
use crate::error::TransportError;

pub use openssh::OpenSshConnector;

/// Opens connections to monitored hosts.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &HostTarget) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An established connection to one host.
///
/// `execute` may be called concurrently; each call gets its own execution
/// context, released when the call returns or its future is dropped.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run `command` and return its raw standard output.
    async fn execute(&self, command: &str) -> Result<Vec<u8>, TransportError>;

    /// Tear the connection down. Further `execute` calls fail.
    async fn close(&self);
}
