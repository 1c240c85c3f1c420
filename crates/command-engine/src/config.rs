//! Engine configuration
//!
//! Every field has a default, so an empty YAML document is a valid
//! configuration:
//!
//! ```yaml
//! default_timeout_ms: 30000
//! retry:
//!   max_retries: 2
//! ssh:
//!   max_connections: 4
//!   idle_timeout_ms: 60000
//! binaries:
//!   kubectl: /usr/local/bin/kubectl
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::DEFAULT_KILL_GRACE;
use crate::error::{Error, ErrorKind, Result};
use crate::stream::{DEFAULT_MAX_BUFFER, Encoding};

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Timeout applied when a descriptor sets none; `None` waits forever
    pub default_timeout_ms: Option<u64>,
    /// Wait between SIGTERM and SIGKILL when stopping a command
    pub kill_grace_ms: u64,
    /// Limit for each of stdout and stderr per execution
    pub max_buffer_bytes: usize,
    /// Output decoding
    pub encoding: Encoding,
    /// Share local, docker and kubernetes adapters between calls
    pub reuse_adapters: bool,
    /// Whole-call retry policy
    pub retry: RetryPolicy,
    /// SSH connection pool
    pub ssh: PoolConfig,
    /// Client programs the adapters drive
    pub binaries: Binaries,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            kill_grace_ms: DEFAULT_KILL_GRACE.as_millis() as u64,
            max_buffer_bytes: DEFAULT_MAX_BUFFER,
            encoding: Encoding::default(),
            reuse_adapters: true,
            retry: RetryPolicy::default(),
            ssh: PoolConfig::default(),
            binaries: Binaries::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate YAML configuration
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::configuration(format!("invalid engine configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Check value ranges serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == Some(0) {
            return Err(Error::configuration("default_timeout_ms must be greater than 0"));
        }
        if self.max_buffer_bytes == 0 {
            return Err(Error::configuration("max_buffer_bytes must be greater than 0"));
        }
        self.retry.validate()?;
        self.ssh.validate()?;
        Ok(())
    }

    /// Default timeout as a duration
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Kill grace as a duration
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// When and how often a failed call is run again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Extra attempts after the first; 0 disables retries
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Retry connection failures
    pub retry_on_connection: bool,
    /// Retry non-zero exits
    pub retry_on_command: bool,
    /// Retry timeouts
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 5_000,
            retry_on_connection: true,
            retry_on_command: true,
            retry_on_timeout: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_retries` and default backoff
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Returns true if `error` may be retried after `attempt` tries
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        if attempt > self.max_retries || !error.is_retryable() {
            return false;
        }
        match error.kind() {
            ErrorKind::Connection => self.retry_on_connection,
            ErrorKind::Command => self.retry_on_command,
            ErrorKind::Timeout => self.retry_on_timeout,
            _ => false,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::configuration(format!(
                "retry.backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

/// SSH connection pool limits and timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Live connections allowed per pool key
    pub max_connections: usize,
    /// Concurrent channels multiplexed on one connection
    pub max_channels_per_connection: usize,
    /// Idle connections are closed after this long
    pub idle_timeout_ms: u64,
    /// Interval between keep-alive probes while idle; 0 disables them
    pub keep_alive_interval_ms: u64,
    /// Limit for establishing a connection
    pub connect_timeout_ms: u64,
    /// How long dispose waits for in-flight work before force-closing
    pub drain_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_channels_per_connection: 1,
            idle_timeout_ms: 60_000,
            keep_alive_interval_ms: 15_000,
            connect_timeout_ms: 10_000,
            drain_grace_ms: 5_000,
        }
    }
}

impl PoolConfig {
    /// Check limits are usable
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::configuration("ssh.max_connections must be greater than 0"));
        }
        if self.max_channels_per_connection == 0 {
            return Err(Error::configuration(
                "ssh.max_channels_per_connection must be greater than 0",
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::configuration("ssh.connect_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Keep-alive interval, if enabled
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Drain grace as a duration
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Paths or names of the client programs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Binaries {
    /// Shell used for `shell: true` local commands
    pub sh: PathBuf,
    /// OpenSSH client
    pub ssh: PathBuf,
    /// OpenSSH SFTP client
    pub sftp: PathBuf,
    /// Password feeder for password authentication
    pub sshpass: PathBuf,
    /// Docker CLI
    pub docker: PathBuf,
    /// Kubernetes CLI
    pub kubectl: PathBuf,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            sh: PathBuf::from("/bin/sh"),
            ssh: PathBuf::from("ssh"),
            sftp: PathBuf::from("sftp"),
            sshpass: PathBuf::from("sshpass"),
            docker: PathBuf::from("docker"),
            kubectl: PathBuf::from("kubectl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.ssh.max_channels_per_connection, 1);
        assert_eq!(config.kill_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
default_timeout_ms: 1500
encoding: latin1
retry:
  max_retries: 3
ssh:
  max_connections: 2
  keep_alive_interval_ms: 0
binaries:
  kubectl: /opt/bin/kubectl
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.encoding, Encoding::Latin1);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.ssh.max_connections, 2);
        assert_eq!(config.ssh.keep_alive_interval(), None);
        assert_eq!(config.binaries.kubectl, PathBuf::from("/opt/bin/kubectl"));
        assert_eq!(config.binaries.docker, PathBuf::from("docker"));
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        for yaml in [
            "ssh:\n  max_connections: 0\n",
            "default_timeout_ms: 0\n",
            "retry:\n  backoff_factor: 0.5\n",
            "unknown_field: true\n",
            "ssh: [1, 2]\n",
        ] {
            let err = EngineConfig::from_yaml_str(yaml).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{}", yaml);
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "kill_grace_ms: 250\n").unwrap();
        assert_eq!(
            EngineConfig::from_file(&path).unwrap().kill_grace(),
            Duration::from_millis(250)
        );

        let err = EngineConfig::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay_ms: 100,
            backoff_factor: 3.0,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(3), Duration::from_millis(900));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
    }

    #[test]
    fn test_should_retry_by_kind() {
        let policy = RetryPolicy::with_retries(2);
        let connection = Error::connection("db:22", "refused");
        assert!(policy.should_retry(&connection, 1));
        assert!(policy.should_retry(&connection, 2));
        assert!(!policy.should_retry(&connection, 3));

        assert!(!policy.should_retry(&Error::configuration("bad"), 1));
        assert!(!policy.should_retry(
            &Error::not_found(crate::error::ResourceKind::Pod, "web-0"),
            1
        ));

        let cancelled = Error::Timeout {
            command: "sleep 10".to_string(),
            deadline: crate::error::Deadline::Cancelled,
            partial: Default::default(),
        };
        assert!(!policy.should_retry(&cancelled, 1));
    }
}
