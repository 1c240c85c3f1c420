//! Local process adapter

use async_trait::async_trait;
use futures_lite::future;
use smol::Timer;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Adapter, TransferOptions, finish, probe};
use crate::command::Command;
use crate::config::Binaries;
use crate::context::ExecContext;
use crate::descriptor::{AdapterOptions, CommandDescriptor, LocalOptions};
use crate::error::{Error, Result};
use crate::process::{self, Invocation};
use crate::result::ExecutionResult;

/// Spawns commands on this host
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    shell: PathBuf,
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAdapter {
    /// Adapter using `/bin/sh` for shell commands
    pub fn new() -> Self {
        Self::with_binaries(&Binaries::default())
    }

    /// Adapter using the configured shell
    pub fn with_binaries(binaries: &Binaries) -> Self {
        Self {
            shell: binaries.sh.clone(),
        }
    }

    fn build(&self, descriptor: &CommandDescriptor, options: &LocalOptions) -> Command {
        let mut command = if descriptor.is_shell() {
            let shell = options
                .shell
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.shell.clone());
            let mut command = Command::new(shell);
            command.arg("-c").arg(descriptor.to_shell_string());
            command
        } else {
            let mut command = Command::new(descriptor.get_command());
            command.args(descriptor.get_args());
            command
        };
        command.envs(descriptor.get_env());
        if let Some(dir) = descriptor.get_cwd() {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn is_available(&self) -> bool {
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg("exit 0");
        probe(command, self.name()).await
    }

    async fn execute(
        &self,
        descriptor: &CommandDescriptor,
        ctx: &ExecContext,
    ) -> Result<ExecutionResult> {
        descriptor.validate()?;
        let default_options = LocalOptions::default();
        let options = match descriptor.adapter_options() {
            AdapterOptions::Local(options) => options,
            _ => &default_options,
        };
        if let Some(dir) = descriptor.get_cwd() {
            if !dir.is_dir() {
                return Err(Error::configuration(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }

        let invocation = Invocation {
            command: self.build(descriptor, options),
            display: descriptor.to_string(),
            stdin: descriptor.get_stdin(),
            adapter: self.name(),
            host: None,
        };
        let result = process::run(invocation, &ctx.for_descriptor(descriptor)).await?;
        finish(result, descriptor)
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        copy(local, Path::new(remote), options).await
    }

    async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<()> {
        copy(Path::new(remote), local, options).await
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

async fn copy(from: &Path, to: &Path, options: &TransferOptions) -> Result<()> {
    let origin = from.display().to_string();
    let destination = to.display().to_string();
    debug!(%origin, %destination, "copying file locally");

    let copied = async {
        smol::fs::copy(from, to)
            .await
            .map(|_| ())
            .map_err(|e| Error::transfer(&origin, &destination, e.to_string()))
    };
    match options.timeout {
        Some(timeout) => {
            future::or(copied, async {
                Timer::after(timeout).await;
                Err(Error::transfer(
                    &origin,
                    &destination,
                    format!("timed out after {}ms", timeout.as_millis()),
                ))
            })
            .await
        }
        None => copied.await,
    }
}
