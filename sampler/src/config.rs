use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::collectors::Commands;
use crate::cycle::CycleSettings;

/// Sampler configuration loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Seconds between two sampling ticks of a host.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Upper bound for one remote command, in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Upper bound for establishing a host connection, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Mount point whose usage is reported as the disk metric.
    #[serde(default = "default_disk_mount")]
    pub disk_mount: String,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Monitored machines.
    #[serde(default)]
    pub hosts: Vec<HostTarget>,
}

/// Reconnect policy for a host whose connection failed or dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial")]
    pub initial_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,

    /// Consecutive failed attempts before a host is given up on. 0 retries forever.
    #[serde(default)]
    pub max_connect_attempts: u32,
}

/// A monitored machine and how to log in to it.
#[derive(Clone, Deserialize)]
pub struct HostTarget {
    /// Display name; defaults to the address.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(alias = "server")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(alias = "userName")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

fn default_interval() -> u64 {
    1
}

fn default_command_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_disk_mount() -> String {
    "/".to_string()
}

fn default_backoff_initial() -> u64 {
    1
}

fn default_backoff_max() -> u64 {
    60
}

fn default_port() -> u16 {
    22
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_backoff_initial(),
            max_secs: default_backoff_max(),
            max_connect_attempts: 0,
        }
    }
}

impl SamplerConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: SamplerConfig = toml::de::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("no hosts configured");
        }
        if self.interval_secs == 0 {
            bail!("interval_secs must be greater than zero");
        }
        if self.command_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            bail!("timeouts must be greater than zero");
        }
        if self.disk_mount.trim().is_empty() {
            bail!("disk_mount must not be empty");
        }
        if self.backoff.initial_secs == 0 || self.backoff.max_secs < self.backoff.initial_secs {
            bail!(
                "backoff must satisfy 0 < initial_secs <= max_secs (got {} and {})",
                self.backoff.initial_secs,
                self.backoff.max_secs
            );
        }
        for host in &self.hosts {
            host.validate()
                .with_context(|| format!("invalid host entry `{}`", host.display_name()))?;
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-host cycle settings derived from this configuration.
    pub fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            interval: Duration::from_secs(self.interval_secs),
            backoff_initial: Duration::from_secs(self.backoff.initial_secs),
            backoff_max: Duration::from_secs(self.backoff.max_secs),
            max_connect_attempts: (self.backoff.max_connect_attempts > 0)
                .then_some(self.backoff.max_connect_attempts),
            commands: Commands::new(&self.disk_mount),
        }
    }
}

impl HostTarget {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    /// `user@address` as understood by ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Key path with a leading `~` expanded to the home directory.
    pub fn resolved_key_path(&self) -> Option<PathBuf> {
        let path = self.key_path.as_ref()?;
        match path.strip_prefix("~") {
            Ok(rest) => dirs::home_dir().map(|home| home.join(rest)),
            Err(_) => Some(path.clone()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            bail!("address must not be empty");
        }
        if self.user.trim().is_empty() {
            bail!("user must not be empty");
        }
        if self.port == 0 {
            bail!("port must not be zero");
        }
        Ok(())
    }
}

// Hand-written so passwords never reach the logs.
impl fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTarget")
            .field("name", &self.display_name())
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[[hosts]]
address = "10.0.0.5"
user = "monitor"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: SamplerConfig = toml::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.interval_secs, 1);
        assert_eq!(cfg.disk_mount, "/");
        assert_eq!(cfg.backoff.initial_secs, 1);
        assert_eq!(cfg.backoff.max_secs, 60);
        assert_eq!(cfg.hosts[0].port, 22);
        assert_eq!(cfg.hosts[0].display_name(), "10.0.0.5");
        assert_eq!(cfg.hosts[0].destination(), "monitor@10.0.0.5");

        let settings = cfg.cycle_settings();
        assert_eq!(settings.interval, Duration::from_secs(1));
        assert_eq!(settings.max_connect_attempts, None);
    }

    #[test]
    fn accepts_legacy_field_names() {
        let cfg: SamplerConfig = toml::from_str(
            r#"
[[hosts]]
server = "db.example.org"
userName = "root"
password = "hunter2"
port = 2222
"#,
        )
        .unwrap();
        let host = &cfg.hosts[0];
        assert_eq!(host.address, "db.example.org");
        assert_eq!(host.user, "root");
        assert_eq!(host.port, 2222);
    }

    #[test]
    fn debug_output_redacts_password() {
        let cfg: SamplerConfig = toml::from_str(
            r#"
[[hosts]]
name = "web-1"
address = "10.0.0.5"
user = "monitor"
password = "hunter2"
"#,
        )
        .unwrap();
        let printed = format!("{:?}", cfg.hosts[0]);
        assert!(printed.contains("web-1"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn rejects_empty_host_list() {
        let cfg: SamplerConfig = toml::from_str("interval_secs = 5").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_backoff() {
        let mut cfg: SamplerConfig = toml::from_str(MINIMAL).unwrap();
        cfg.backoff.initial_secs = 30;
        cfg.backoff.max_secs = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_attempts_zero_means_forever() {
        let mut cfg: SamplerConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(cfg.cycle_settings().max_connect_attempts, None);
        cfg.backoff.max_connect_attempts = 3;
        assert_eq!(cfg.cycle_settings().max_connect_attempts, Some(3));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
interval_secs = 5
disk_mount = "/var"

[backoff]
max_connect_attempts = 4

[[hosts]]
name = "web-1"
address = "10.0.0.5"
user = "monitor"
key_path = "/etc/perfmon/id_ed25519"
"#
        )
        .unwrap();

        let cfg = SamplerConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.interval_secs, 5);
        assert_eq!(cfg.backoff.max_connect_attempts, 4);
        assert_eq!(
            cfg.hosts[0].resolved_key_path(),
            Some(PathBuf::from("/etc/perfmon/id_ed25519"))
        );
        assert_eq!(
            cfg.cycle_settings().commands.for_kind(crate::collectors::MetricKind::Disk),
            "df -P -k '/var'"
        );
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: SamplerConfig = toml::from_str(include_str!("../config.example.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.hosts.len(), 2);
        assert!(cfg.hosts[1].password.is_some());
    }

    #[test]
    fn invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[[hosts]]\naddress = \"\"\nuser = \"x\"\n").unwrap();
        let err = SamplerConfig::from_file(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("address must not be empty"));
    }
}
