//! Error types for command execution
//!
//! Every failed call surfaces exactly one of the variants below. Transport
//! specific failures are mapped onto them by [`crate::classify`].

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::result::ExecutionResult;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// The descriptor or adapter options are missing or invalid
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// The transport could not be established or was lost
    #[error("connection to {target} failed: {reason}")]
    Connection {
        /// The endpoint that was being reached
        target: String,
        /// The detailed reason for the connection failure
        reason: String,
    },

    /// The command ran and did not exit successfully
    #[error("command `{command}` {}", describe_failure(.result, .reason.as_deref()))]
    Command {
        /// The command as the caller described it
        command: String,
        /// Whatever was captured before the command finished
        result: Box<ExecutionResult>,
        /// Set when the engine stopped the command itself
        reason: Option<String>,
    },

    /// The deadline passed, or the call was cancelled, before the command finished
    #[error("command `{command}` {deadline}")]
    Timeout {
        /// The command as the caller described it
        command: String,
        /// Why the command was stopped
        deadline: Deadline,
        /// Output captured before the command was stopped
        partial: PartialOutput,
    },

    /// A file copy to or from the target failed
    #[error("transfer from {origin} to {destination} failed: {reason}")]
    Transfer {
        /// Where the bytes were read from
        origin: String,
        /// Where the bytes were written to
        destination: String,
        /// The detailed reason for the transfer failure
        reason: String,
    },

    /// A pod, container, selector or program could not be resolved
    #[error("{kind} not found: {name}")]
    NotFound {
        /// What was being looked up
        kind: ResourceKind,
        /// The name or selector that matched nothing
        name: String,
    },
}

/// Discriminant of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Configuration`]
    Configuration,
    /// See [`Error::Connection`]
    Connection,
    /// See [`Error::Command`]
    Command,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::Transfer`]
    Transfer,
    /// See [`Error::NotFound`]
    NotFound,
}

/// The kind of resource a [`Error::NotFound`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A local executable
    Program,
    /// A docker container
    Container,
    /// A kubernetes pod
    Pod,
    /// A kubernetes label selector that matched no pod
    Selector,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Program => "program",
            ResourceKind::Container => "container",
            ResourceKind::Pod => "pod",
            ResourceKind::Selector => "pod matching selector",
        };
        f.write_str(name)
    }
}

/// Why an execution was stopped before it completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// The configured timeout elapsed
    Elapsed(Duration),
    /// The caller cancelled the execution
    Cancelled,
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deadline::Elapsed(timeout) => write!(f, "timed out after {}ms", timeout.as_millis()),
            Deadline::Cancelled => f.write_str("was cancelled before it completed"),
        }
    }
}

/// Output captured before an execution failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialOutput {
    /// Decoded stdout captured so far
    pub stdout: String,
    /// Decoded stderr captured so far
    pub stderr: String,
}

impl PartialOutput {
    /// Returns true if nothing was captured
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

fn describe_failure(result: &ExecutionResult, reason: Option<&str>) -> String {
    let status = match (result.exit_code, result.signal.as_deref()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(signal)) => format!("was terminated by {}", signal),
        (None, None) => "ended without an exit status".to_string(),
    };
    match reason {
        Some(reason) => format!("{} ({})", status, reason),
        None => status,
    }
}

impl Error {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(target: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Connection {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a transfer error
    pub fn transfer(
        origin: impl Into<String>,
        destination: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Transfer {
            origin: origin.into(),
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// The taxonomy bucket this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Command { .. } => ErrorKind::Command,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Transfer { .. } => ErrorKind::Transfer,
            Error::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// Output captured before a command or timeout failure
    pub fn partial_output(&self) -> Option<PartialOutput> {
        match self {
            Error::Command { result, .. } => Some(PartialOutput {
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
            }),
            Error::Timeout { partial, .. } => Some(partial.clone()),
            _ => None,
        }
    }

    /// The result attached to a command failure
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Error::Command { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Returns true if the caller cancelled the execution
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Timeout {
                deadline: Deadline::Cancelled,
                ..
            }
        )
    }

    /// Returns true if running the same call again could succeed
    ///
    /// Configuration, not-found and transfer failures fail the same way every
    /// time. So does a call the caller cancelled, or one the engine stopped
    /// for exceeding its output limit.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Connection => true,
            ErrorKind::Command => !matches!(self, Error::Command { reason: Some(_), .. }),
            ErrorKind::Timeout => !self.is_cancelled(),
            ErrorKind::Configuration | ErrorKind::NotFound | ErrorKind::Transfer => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
