//! Docker adapter driving the docker CLI

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{Adapter, PROBE_TIMEOUT, TransferOptions, finish, probe, run_transfer};
use crate::classify;
use crate::command::Command;
use crate::config::Binaries;
use crate::context::ExecContext;
use crate::descriptor::{CommandDescriptor, DockerOptions};
use crate::error::{Error, Result};
use crate::process::{self, Invocation};
use crate::result::ExecutionResult;

/// Runs commands in a running container, or in a throw-away one from an image
#[derive(Debug, Clone)]
pub struct DockerAdapter {
    options: DockerOptions,
    docker: PathBuf,
}

impl DockerAdapter {
    /// Adapter for one container or image
    pub fn new(options: DockerOptions, binaries: &Binaries) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            docker: binaries.docker.clone(),
        })
    }

    /// The container or image commands run in
    pub fn target(&self) -> &str {
        self.options
            .container
            .as_deref()
            .filter(|c| !c.is_empty())
            .or(self.options.image.as_deref())
            .unwrap_or_default()
    }

    fn container(&self) -> Option<&str> {
        self.options.container.as_deref().filter(|c| !c.trim().is_empty())
    }

    fn build(&self, descriptor: &CommandDescriptor) -> Command {
        let mut command = Command::new(&self.docker);
        match self.container() {
            Some(_) => command.arg("exec"),
            None => command.args(["run", "--rm"]),
        };
        if descriptor.get_stdin().is_some() || self.container().is_none() {
            command.arg("-i");
        }
        if self.options.tty {
            command.arg("-t");
        }
        if let Some(user) = &self.options.user {
            command.arg("-u").arg(user);
        }
        let workdir = descriptor
            .get_cwd()
            .map(|dir| dir.to_string_lossy().into_owned())
            .or_else(|| self.options.workdir.clone());
        if let Some(dir) = workdir {
            command.arg("-w").arg(dir);
        }
        for (key, value) in descriptor.get_env() {
            command.arg("-e").arg(format!("{}={}", key, value));
        }
        command.arg(self.target());

        if descriptor.is_shell() {
            command.args(["sh", "-c"]).arg(descriptor.to_shell_string());
        } else {
            command.arg(descriptor.get_command()).args(descriptor.get_args());
        }
        command
    }

    fn require_container(&self, action: &str) -> Result<&str> {
        self.container().ok_or_else(|| {
            Error::configuration(format!("{} requires a named container, not an image", action))
        })
    }

    fn copy(&self, from: &str, to: &str, options: &TransferOptions) -> Command {
        let mut command = Command::new(&self.docker);
        command.arg("cp");
        if options.preserve_attributes {
            command.arg("-a");
        }
        command.arg(from).arg(to);
        command
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        let mut version = Command::new(&self.docker);
        version.args(["version", "--format", "{{.Server.Version}}"]);
        if !probe(version, self.name()).await {
            return false;
        }
        let Some(container) = self.container() else {
            return true;
        };

        let mut inspect = Command::new(&self.docker);
        inspect
            .args(["inspect", "--format", "{{.State.Running}}"])
            .arg(container);
        let invocation = Invocation {
            display: inspect.display(),
            command: inspect,
            stdin: None,
            adapter: self.name(),
            host: None,
        };
        match process::run(invocation, &ExecContext::with_timeout(PROBE_TIMEOUT)).await {
            Ok(result) => result.success() && result.stdout.trim() == "true",
            Err(_) => false,
        }
    }

    async fn execute(
        &self,
        descriptor: &CommandDescriptor,
        ctx: &ExecContext,
    ) -> Result<ExecutionResult> {
        descriptor.validate()?;
        let invocation = Invocation {
            command: self.build(descriptor),
            display: descriptor.to_string(),
            stdin: descriptor.get_stdin(),
            adapter: self.name(),
            host: Some(self.target().to_string()),
        };
        let result = process::run(invocation, &ctx.for_descriptor(descriptor)).await?;
        let result = classify::docker(result, self.target())?;
        finish(result, descriptor)
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        let container = self.require_container("upload")?;
        let origin = local.display().to_string();
        let destination = format!("{}:{}", container, remote);
        let command = self.copy(&origin, &destination, options);
        run_transfer(command, None, self.name(), &origin, &destination, options).await
    }

    async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<()> {
        let container = self.require_container("download")?;
        let origin = format!("{}:{}", container, remote);
        let destination = local.display().to_string();
        let command = self.copy(&origin, &destination, options);
        run_transfer(command, None, self.name(), &origin, &destination, options).await
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}
