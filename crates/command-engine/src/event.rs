//! Live output chunks delivered while a command runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A decoded chunk of output from a running command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// When the chunk was read
    pub timestamp: DateTime<Utc>,
    /// Which stream produced it
    pub source: OutputSource,
    /// Decoded text of the chunk
    pub data: String,
}

impl OutputChunk {
    /// Create a new chunk stamped with the current time
    pub fn new(source: OutputSource, data: String) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            data,
        }
    }
}

/// Source of an output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}
