//! Transport adapters
//!
//! Each adapter reaches one kind of target and implements the same contract:
//! an availability probe, execution, file transfer in both directions, and
//! disposal of whatever it holds.

pub mod docker;
pub mod kubernetes;
pub mod local;
pub mod ssh;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::command::Command;
use crate::context::ExecContext;
use crate::descriptor::CommandDescriptor;
use crate::error::{Error, Result};
use crate::process::{self, Invocation};
use crate::result::ExecutionResult;

pub use docker::DockerAdapter;
pub use kubernetes::KubernetesAdapter;
pub use local::LocalAdapter;
pub use ssh::{SshAdapter, SshConnection};

/// How long availability probes may take
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Common contract of every transport
#[async_trait]
pub trait Adapter: std::fmt::Debug + Send + Sync + 'static {
    /// Adapter name recorded in results, e.g. `ssh`
    fn name(&self) -> &'static str;

    /// Cheap probe for whether the target can be reached; never fails
    async fn is_available(&self) -> bool;

    /// Run the descriptor to completion
    ///
    /// Returns a `Command` error for a non-zero exit unless the descriptor
    /// sets `nothrow`.
    async fn execute(&self, descriptor: &CommandDescriptor, ctx: &ExecContext)
    -> Result<ExecutionResult>;

    /// Copy a local file to the target
    async fn upload_file(&self, local: &Path, remote: &str, options: &TransferOptions)
    -> Result<()>;

    /// Copy a file from the target to a local path
    async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<()>;

    /// Release everything this adapter holds; idempotent
    async fn dispose(&self) -> Result<()>;
}

/// Options for file transfers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Limit for the whole copy
    pub timeout: Option<Duration>,
    /// Keep modes and times where the transport supports it
    pub preserve_attributes: bool,
}

impl TransferOptions {
    /// Options with a timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Apply `nothrow` to a finished result
pub(crate) fn finish(result: ExecutionResult, descriptor: &CommandDescriptor) -> Result<ExecutionResult> {
    if result.success() || descriptor.is_nothrow() {
        return Ok(result);
    }
    Err(Error::Command {
        command: descriptor.to_string(),
        result: Box::new(result),
        reason: None,
    })
}

/// Run a client-side copy, mapping any failure to a transfer error
pub(crate) async fn run_transfer(
    command: Command,
    stdin: Option<&crate::stdin::Stdin>,
    adapter: &'static str,
    origin: &str,
    destination: &str,
    options: &TransferOptions,
) -> Result<()> {
    let ctx = ExecContext {
        timeout: options.timeout,
        ..ExecContext::default()
    };
    let invocation = Invocation {
        display: command.display(),
        command,
        stdin,
        adapter,
        host: None,
    };
    debug!(adapter, origin, destination, "transferring file");

    match process::run(invocation, &ctx).await {
        Ok(result) if result.success() => Ok(()),
        Ok(result) => {
            let stderr = result.stderr.trim();
            let reason = if stderr.is_empty() {
                format!("copy exited with code {:?}", result.exit_code)
            } else {
                stderr.to_string()
            };
            Err(Error::transfer(origin, destination, reason))
        }
        Err(e @ Error::Configuration { .. }) => Err(e),
        Err(e) => Err(Error::transfer(origin, destination, e.to_string())),
    }
}

/// Run a probe command; true only for a zero exit within the probe timeout
pub(crate) async fn probe(command: Command, adapter: &'static str) -> bool {
    let invocation = Invocation {
        display: command.display(),
        command,
        stdin: None,
        adapter,
        host: None,
    };
    match process::run(invocation, &ExecContext::with_timeout(PROBE_TIMEOUT)).await {
        Ok(result) => result.success(),
        Err(e) => {
            debug!(adapter, error = %e, "availability probe failed");
            false
        }
    }
}
