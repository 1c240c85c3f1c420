//! Kubernetes adapter driving kubectl
//!
//! A pod given as `-l key=value` (or through `selector`) is resolved to the
//! first pod the API server lists for that selector, once per execution.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Adapter, PROBE_TIMEOUT, TransferOptions, finish, probe, run_transfer};
use crate::classify;
use crate::command::Command;
use crate::config::Binaries;
use crate::context::ExecContext;
use crate::descriptor::{CommandDescriptor, KubernetesOptions, PodRef};
use crate::error::{Error, ResourceKind, Result};
use crate::process::{self, Invocation};
use crate::result::ExecutionResult;
use crate::shell;

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: Metadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

impl Pod {
    fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }
}

/// Runs commands in a pod with `kubectl exec`
#[derive(Debug, Clone)]
pub struct KubernetesAdapter {
    options: KubernetesOptions,
    kubectl: PathBuf,
}

impl KubernetesAdapter {
    /// Adapter for one pod or selector
    pub fn new(options: KubernetesOptions, binaries: &Binaries) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            kubectl: binaries.kubectl.clone(),
        })
    }

    /// kubectl with `args`, followed by context and kubeconfig flags
    fn kubectl<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.kubectl);
        command.args(args);
        if let Some(context) = &self.options.context {
            command.arg("--context").arg(context);
        }
        if let Some(kubeconfig) = &self.options.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        command
    }

    async fn query(&self, command: Command) -> Result<ExecutionResult> {
        let invocation = Invocation {
            display: command.display(),
            command,
            stdin: None,
            adapter: "kubernetes",
            host: None,
        };
        process::run(invocation, &ExecContext::with_timeout(PROBE_TIMEOUT)).await
    }

    /// Name of the first pod matching `selector` in `namespace`
    ///
    /// Pods are taken in the order the API server lists them.
    pub async fn get_pod_from_selector(&self, selector: &str, namespace: &str) -> Result<String> {
        let command = self.kubectl(["get", "pods", "-n", namespace, "-l", selector, "-o", "json"]);
        let result = classify::kubectl(self.query(command).await?, selector)?;
        if !result.success() {
            return Err(Error::connection(
                "kubernetes api server",
                format!("listing pods for {} failed: {}", selector, result.stderr.trim()),
            ));
        }

        let pods: PodList = serde_json::from_str(&result.stdout).map_err(|e| {
            Error::connection(
                "kubernetes api server",
                format!("unreadable pod list for {}: {}", selector, e),
            )
        })?;
        let pod = pods
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(ResourceKind::Selector, selector))?;
        debug!(selector, namespace, pod = %pod.metadata.name, "resolved pod from selector");
        Ok(pod.metadata.name)
    }

    /// Returns true if the pod reports a `Ready` condition; false for unknown pods
    pub async fn is_pod_ready(&self, pod: &str, namespace: &str) -> bool {
        let command = self.kubectl(["get", "pod", pod, "-n", namespace, "-o", "json"]);
        match self.query(command).await {
            Ok(result) if result.success() => serde_json::from_str::<Pod>(&result.stdout)
                .map(|p| p.is_ready())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The concrete pod this adapter targets
    pub async fn resolve_pod(&self) -> Result<String> {
        match self.options.pod_ref() {
            Some(PodRef::Name(name)) => Ok(name),
            Some(PodRef::Selector(selector)) => {
                self.get_pod_from_selector(&selector, self.options.namespace())
                    .await
            }
            None => Err(Error::configuration(
                "kubernetes target requires a pod or a selector",
            )),
        }
    }

    fn build(&self, pod: &str, descriptor: &CommandDescriptor) -> Command {
        let mut command = Command::new(&self.kubectl);
        command.arg("exec");
        if descriptor.get_stdin().is_some() {
            command.arg("-i");
        }
        if self.options.tty {
            command.arg("-t");
        }
        command.args(["-n", self.options.namespace(), pod]);
        if let Some(container) = &self.options.container {
            command.arg("-c").arg(container);
        }
        command.args(&self.options.exec_flags);
        if let Some(context) = &self.options.context {
            command.arg("--context").arg(context);
        }
        if let Some(kubeconfig) = &self.options.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        command.arg("--");

        let needs_shell = descriptor.is_shell()
            || descriptor.get_cwd().is_some()
            || !descriptor.get_env().is_empty();
        if needs_shell {
            let script = shell::with_context(
                &descriptor.to_shell_string(),
                descriptor.get_cwd(),
                descriptor.get_env(),
            );
            command.args(["sh", "-c"]).arg(script);
        } else {
            command.arg(descriptor.get_command()).args(descriptor.get_args());
        }
        command
    }

    fn copy(&self, from: &str, to: &str, options: &TransferOptions) -> Command {
        let mut command = self.kubectl(["cp", from, to]);
        if let Some(container) = &self.options.container {
            command.arg("-c").arg(container);
        }
        if !options.preserve_attributes {
            command.arg("--no-preserve=true");
        }
        command
    }

    fn pod_path(&self, pod: &str, path: &str) -> String {
        format!("{}/{}:{}", self.options.namespace(), pod, path)
    }
}

#[async_trait]
impl Adapter for KubernetesAdapter {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn is_available(&self) -> bool {
        if !probe(self.kubectl(["version", "--client"]), self.name()).await {
            return false;
        }
        match self.resolve_pod().await {
            Ok(pod) => self.is_pod_ready(&pod, self.options.namespace()).await,
            Err(_) => false,
        }
    }

    async fn execute(
        &self,
        descriptor: &CommandDescriptor,
        ctx: &ExecContext,
    ) -> Result<ExecutionResult> {
        descriptor.validate()?;
        let pod = self.resolve_pod().await?;
        let invocation = Invocation {
            command: self.build(&pod, descriptor),
            display: descriptor.to_string(),
            stdin: descriptor.get_stdin(),
            adapter: self.name(),
            host: Some(format!("{}/{}", self.options.namespace(), pod)),
        };
        let result = process::run(invocation, &ctx.for_descriptor(descriptor)).await?;
        let result = classify::kubectl(result, &pod)?;
        finish(result, descriptor)
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        let origin = local.display().to_string();
        let pod = self
            .resolve_pod()
            .await
            .map_err(|e| Error::transfer(&origin, remote, e.to_string()))?;
        let destination = self.pod_path(&pod, remote);
        let command = self.copy(&origin, &destination, options);
        run_transfer(command, None, self.name(), &origin, &destination, options).await
    }

    async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<()> {
        let destination = local.display().to_string();
        let pod = self
            .resolve_pod()
            .await
            .map_err(|e| Error::transfer(remote, &destination, e.to_string()))?;
        let origin = self.pod_path(&pod, remote);
        let command = self.copy(&origin, &destination, options);
        run_transfer(command, None, self.name(), &origin, &destination, options).await
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}
