//! Normalized outcome of one completed execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The result of a completed attempt, identical in shape for every adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Decoded stdout
    pub stdout: String,
    /// Decoded stderr
    pub stderr: String,
    /// Exit code if the process exited normally
    pub exit_code: Option<i32>,
    /// Name of the signal that terminated the process, e.g. `SIGKILL`
    pub signal: Option<String>,
    /// Wall-clock time of the attempt
    #[serde(rename = "durationMs", with = "duration_ms")]
    pub duration: Duration,
    /// Which adapter ran the command
    pub adapter: String,
    /// Remote endpoint, e.g. `host:port`, `container` or `namespace/pod`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Returns true if the process exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
