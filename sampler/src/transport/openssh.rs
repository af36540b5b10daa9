//! Transport built on the system OpenSSH client.
//!
//! `connect` starts a ControlMaster process holding the one authenticated
//! connection to the host; every `execute` is a short-lived `ssh -S` client
//! multiplexed over that master, so concurrent commands share the
//! connection without sharing a session. Password logins go through
//! `sshpass`, which reads the secret from its environment.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Connection, Connector};
use crate::config::HostTarget;
use crate::error::TransportError;

/// Exit status ssh uses for its own failures, as opposed to the remote command's.
const SSH_FAILURE_STATUS: i32 = 255;

/// Pause between two readiness checks of a starting master.
const READY_POLL: Duration = Duration::from_millis(100);

/// Opens [`OpenSshConnection`]s by spawning `ssh` ControlMaster processes.
#[derive(Debug)]
pub struct OpenSshConnector {
    ssh_program: PathBuf,
    control_dir: PathBuf,
    connect_timeout: Duration,
    command_timeout: Duration,
    next_id: AtomicU64,
}

impl OpenSshConnector {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            control_dir: std::env::temp_dir(),
            connect_timeout,
            command_timeout,
            next_id: AtomicU64::new(0),
        }
    }

    /// Use a specific ssh binary instead of the one on `PATH`.
    pub fn with_ssh_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// Directory for ControlMaster sockets.
    pub fn with_control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }

    fn control_path(&self, target: &HostTarget) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let host: String = target
            .address
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .take(32)
            .collect();
        self.control_dir
            .join(format!("perfmon-{}-{}-{id}.sock", std::process::id(), host))
    }

    fn master_command(&self, target: &HostTarget, control_path: &Path) -> Command {
        let mut cmd = match &target.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(&self.ssh_program).env("SSHPASS", password);
                cmd
            }
            None => Command::new(&self.ssh_program),
        };
        cmd.args(master_args(target, control_path, self.connect_timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn master_ready(&self, target: &HostTarget, control_path: &Path) -> bool {
        Command::new(&self.ssh_program)
            .arg("-S")
            .arg(control_path)
            .args(["-O", "check"])
            .arg(target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Wait until the master accepts clients, or report why it died.
    async fn wait_until_ready(
        &self,
        target: &HostTarget,
        control_path: &Path,
        master: &mut Child,
    ) -> Result<(), TransportError> {
        loop {
            if let Ok(Some(status)) = master.try_wait() {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(TransportError::Connect {
                    host: target.display_name().to_string(),
                    reason: format!("ssh exited with {status}: {}", stderr.trim()),
                });
            }
            if self.master_ready(target, control_path).await {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, target: &HostTarget) -> Result<Arc<dyn Connection>, TransportError> {
        let control_path = self.control_path(target);
        let program = if target.password.is_some() {
            "sshpass".to_string()
        } else {
            self.ssh_program.display().to_string()
        };

        let mut master = self
            .master_command(target, &control_path)
            .spawn()
            .map_err(|e| TransportError::Spawn {
                program,
                reason: e.to_string(),
            })?;

        let ready = tokio::time::timeout(
            self.connect_timeout,
            self.wait_until_ready(target, &control_path, &mut master),
        )
        .await;

        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let _ = master.kill().await;
                return Err(TransportError::Connect {
                    host: target.display_name().to_string(),
                    reason: format!("not ready after {:?}", self.connect_timeout),
                });
            }
        }

        if let Some(pipe) = master.stderr.take() {
            tokio::spawn(drain_stderr(target.display_name().to_string(), pipe));
        }

        info!(
            host = %target.display_name(),
            socket = %control_path.display(),
            "SSH master connection established"
        );

        Ok(Arc::new(OpenSshConnection {
            host: target.display_name().to_string(),
            destination: target.destination(),
            ssh_program: self.ssh_program.clone(),
            control_path,
            command_timeout: self.command_timeout,
            master: Mutex::new(Some(master)),
        }))
    }
}

/// One ControlMaster connection to a host.
#[derive(Debug)]
pub struct OpenSshConnection {
    host: String,
    destination: String,
    ssh_program: PathBuf,
    control_path: PathBuf,
    command_timeout: Duration,
    master: Mutex<Option<Child>>,
}

impl OpenSshConnection {
    async fn ensure_master_alive(&self) -> Result<(), TransportError> {
        let mut master = self.master.lock().await;
        let exited = match master.as_mut() {
            None => Some("connection closed".to_string()),
            Some(child) => match child.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(format!("master exited with {status}")),
                Err(e) => Some(e.to_string()),
            },
        };
        match exited {
            None => Ok(()),
            Some(reason) => {
                master.take();
                Err(TransportError::Disconnected { reason })
            }
        }
    }
}

#[async_trait]
impl Connection for OpenSshConnection {
    async fn execute(&self, command: &str) -> Result<Vec<u8>, TransportError> {
        // Without a live master, `ssh -S` would silently open a fresh connection.
        self.ensure_master_alive().await?;

        let output = Command::new(&self.ssh_program)
            .args(client_args(&self.control_path, &self.destination, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.command_timeout, output)
            .await
            .map_err(|_| TransportError::Timeout {
                command: command.to_string(),
                after: self.command_timeout,
            })?
            .map_err(|e| TransportError::Spawn {
                program: self.ssh_program.display().to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            host = %self.host,
            command,
            status = ?output.status.code(),
            bytes = output.stdout.len(),
            "Remote command finished"
        );

        classify(command, output.status.code(), output.stdout, &output.stderr)
    }

    async fn close(&self) {
        let Some(mut master) = self.master.lock().await.take() else {
            return;
        };

        let exit = Command::new(&self.ssh_program)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        if tokio::time::timeout(self.command_timeout, exit).await.is_err() {
            warn!(host = %self.host, "ssh -O exit timed out");
        }

        let _ = master.kill().await;
        let _ = tokio::fs::remove_file(&self.control_path).await;
        info!(host = %self.host, "SSH master connection closed");
    }
}

fn master_args(target: &HostTarget, control_path: &Path, connect_timeout: Duration) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-M".into(), "-N".into(), "-S".into(), control_path.into()];

    let mut option = |o: String| {
        args.push("-o".into());
        args.push(o.into());
    };
    option("ControlPersist=no".to_string());
    option(format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)));
    option("StrictHostKeyChecking=accept-new".to_string());
    option("ServerAliveInterval=5".to_string());
    option("ServerAliveCountMax=3".to_string());
    if target.password.is_none() {
        option("BatchMode=yes".to_string());
    }

    if let Some(key) = target.resolved_key_path() {
        args.push("-i".into());
        args.push(key.into());
    }
    args.push("-p".into());
    args.push(target.port.to_string().into());
    args.push(target.destination().into());
    args
}

fn client_args(control_path: &Path, destination: &str, command: &str) -> Vec<OsString> {
    vec![
        "-S".into(),
        control_path.into(),
        "-o".into(),
        "ControlMaster=no".into(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-T".into(),
        destination.into(),
        "--".into(),
        command.into(),
    ]
}

/// Map a finished client invocation onto the transport's outcomes.
fn classify(
    command: &str,
    status: Option<i32>,
    stdout: Vec<u8>,
    stderr: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    match status {
        Some(0) => Ok(stdout),
        Some(SSH_FAILURE_STATUS) => Err(TransportError::Disconnected { reason: stderr }),
        status => Err(TransportError::Execution {
            command: command.to_string(),
            status,
            stderr,
        }),
    }
}

/// Forward the master's diagnostics to the log until it exits, so a full
/// pipe never stalls a long-lived session.
async fn drain_stderr(host: String, pipe: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(host = %host, "ssh: {line}");
    }
}
