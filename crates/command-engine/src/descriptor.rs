//! Command descriptors: what to run and where
//!
//! A [`CommandDescriptor`] is an immutable value built with chained setters.
//! It is `Clone` so the engine can replay it for a retry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::shell;
use crate::stdin::Stdin;

/// A command to be executed on some target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDescriptor {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    shell: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdin: Option<Stdin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default)]
    nothrow: bool,
    #[serde(default)]
    adapter_options: AdapterOptions,
}

impl CommandDescriptor {
    /// Create a descriptor for a program (or shell text, see [`Self::shell`])
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            shell: false,
            cwd: None,
            env: BTreeMap::new(),
            stdin: None,
            timeout_ms: None,
            nothrow: false,
            adapter_options: AdapterOptions::default(),
        }
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the command through a shell instead of executing it directly
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable, merged over the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.env.insert(key.into(), value.into());
        }
        self
    }

    /// Feed input to the command's stdin
    pub fn stdin(mut self, stdin: impl Into<Stdin>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Fail with a timeout if the command runs longer than `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Return non-zero exits as results instead of errors
    pub fn nothrow(mut self, nothrow: bool) -> Self {
        self.nothrow = nothrow;
        self
    }

    /// Select the target to run on
    pub fn on(mut self, options: impl Into<AdapterOptions>) -> Self {
        self.adapter_options = options.into();
        self
    }

    /// The program or shell text
    pub fn get_command(&self) -> &str {
        &self.command
    }

    /// The arguments
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Whether the command runs through a shell
    pub fn is_shell(&self) -> bool {
        self.shell
    }

    /// The working directory
    pub fn get_cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// The environment overrides
    pub fn get_env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// The stdin source
    pub fn get_stdin(&self) -> Option<&Stdin> {
        self.stdin.as_ref()
    }

    /// The per-call timeout
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Whether non-zero exits are returned as results
    pub fn is_nothrow(&self) -> bool {
        self.nothrow
    }

    /// The target selection
    pub fn adapter_options(&self) -> &AdapterOptions {
        &self.adapter_options
    }

    /// The command as one shell line
    ///
    /// In shell mode the command text is kept verbatim and only the
    /// arguments are escaped; otherwise the program is escaped too.
    pub fn to_shell_string(&self) -> String {
        if self.shell {
            let mut line = self.command.clone();
            for arg in &self.args {
                line.push(' ');
                line.push_str(&shell::shell_escape(arg));
            }
            line
        } else {
            shell::join_command(&self.command, &self.args)
        }
    }

    /// Validate fields common to every adapter
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::configuration("command must not be empty"));
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|key| key.is_empty() || key.contains('=') || key.contains('\0'))
        {
            return Err(Error::configuration(format!(
                "invalid environment variable name {:?}",
                key
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(Error::configuration("timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

/// Target selection, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterOptions {
    /// Spawn on this host
    Local(LocalOptions),
    /// Run on a remote host over SSH
    Ssh(SshOptions),
    /// Exec inside a docker container
    Docker(DockerOptions),
    /// Exec inside a kubernetes pod
    Kubernetes(KubernetesOptions),
}

impl AdapterOptions {
    /// Name of the adapter these options select
    pub fn adapter_name(&self) -> &'static str {
        match self {
            AdapterOptions::Local(_) => "local",
            AdapterOptions::Ssh(_) => "ssh",
            AdapterOptions::Docker(_) => "docker",
            AdapterOptions::Kubernetes(_) => "kubernetes",
        }
    }
}

impl Default for AdapterOptions {
    fn default() -> Self {
        AdapterOptions::Local(LocalOptions::default())
    }
}

impl From<LocalOptions> for AdapterOptions {
    fn from(options: LocalOptions) -> Self {
        AdapterOptions::Local(options)
    }
}

impl From<SshOptions> for AdapterOptions {
    fn from(options: SshOptions) -> Self {
        AdapterOptions::Ssh(options)
    }
}

impl From<DockerOptions> for AdapterOptions {
    fn from(options: DockerOptions) -> Self {
        AdapterOptions::Docker(options)
    }
}

impl From<KubernetesOptions> for AdapterOptions {
    fn from(options: KubernetesOptions) -> Self {
        AdapterOptions::Kubernetes(options)
    }
}

/// Local process options
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalOptions {
    /// Shell used for shell-mode commands; defaults to the engine's `sh`
    pub shell: Option<String>,
}

/// SSH target
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshOptions {
    /// Target host (hostname or IP)
    pub host: String,
    /// Login user
    pub username: String,
    /// SSH port, 22 when unset
    pub port: Option<u16>,
    /// Password, sent through `sshpass`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to identity file (private key)
    pub private_key: Option<PathBuf>,
    /// `StrictHostKeyChecking`; left to the ssh config when unset
    pub strict_host_key_checking: Option<bool>,
    /// Additional ssh arguments
    pub extra_args: Vec<String>,
}

impl SshOptions {
    /// Create options for `username@host`
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Self::default()
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Authenticate with a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Authenticate with a private key
    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Add an extra ssh argument
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// The effective port
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    /// `username@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Check required fields before any I/O
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::configuration("ssh target requires a host"));
        }
        if self.username.trim().is_empty() {
            return Err(Error::configuration("ssh target requires a username"));
        }
        if self.port == Some(0) {
            return Err(Error::configuration("ssh port must not be 0"));
        }
        Ok(())
    }
}

impl fmt::Debug for SshOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshOptions")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .field("extra_args", &self.extra_args)
            .finish()
    }
}

/// Docker target
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerOptions {
    /// Running container to exec in
    pub container: Option<String>,
    /// Image for a throw-away `docker run --rm` when no container is named
    pub image: Option<String>,
    /// User to run as in the container
    pub user: Option<String>,
    /// Working directory in the container when the descriptor sets none
    pub workdir: Option<String>,
    /// Allocate a TTY
    pub tty: bool,
}

impl DockerOptions {
    /// Exec in an existing container
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            container: Some(name.into()),
            ..Self::default()
        }
    }

    /// Run in a fresh container from an image
    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Self::default()
        }
    }

    /// Set the user to run as
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Check required fields before any I/O
    pub fn validate(&self) -> Result<()> {
        let named = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if !named(&self.container) && !named(&self.image) {
            return Err(Error::configuration(
                "docker target requires a container or an image",
            ));
        }
        Ok(())
    }
}

/// Kubernetes target
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesOptions {
    /// Pod name, or `-l key=value` to resolve by selector
    pub pod: Option<String>,
    /// Label selector, takes precedence over `pod`
    pub selector: Option<String>,
    /// Namespace, `default` when unset
    pub namespace: Option<String>,
    /// Container within the pod
    pub container: Option<String>,
    /// kubeconfig context
    pub context: Option<String>,
    /// Path to a kubeconfig file
    pub kubeconfig: Option<PathBuf>,
    /// Extra flags for `kubectl exec`, e.g. `--pod-running-timeout=1m`
    pub exec_flags: Vec<String>,
    /// Allocate a TTY
    pub tty: bool,
}

/// How a pod is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodRef {
    /// A literal pod name
    Name(String),
    /// A label selector resolved to the first matching pod
    Selector(String),
}

impl PodRef {
    /// Parse `name` or `-l key=value`
    pub fn parse(spec: &str) -> Option<PodRef> {
        let spec = spec.trim();
        if let Some(selector) = spec.strip_prefix("-l") {
            let selector = selector.trim_start_matches('=').trim();
            return (!selector.is_empty()).then(|| PodRef::Selector(selector.to_string()));
        }
        (!spec.is_empty()).then(|| PodRef::Name(spec.to_string()))
    }
}

impl KubernetesOptions {
    /// Target a named pod
    pub fn pod(pod: impl Into<String>) -> Self {
        Self {
            pod: Some(pod.into()),
            ..Self::default()
        }
    }

    /// Target the first pod matching a label selector
    pub fn selector(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Self::default()
        }
    }

    /// Set the namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the container
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// The effective namespace
    pub fn namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or("default")
    }

    /// How the target pod is addressed
    pub fn pod_ref(&self) -> Option<PodRef> {
        if let Some(selector) = self.selector.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Some(PodRef::Selector(selector.to_string()));
        }
        self.pod.as_deref().and_then(PodRef::parse)
    }

    /// Check required fields before any I/O
    pub fn validate(&self) -> Result<()> {
        if self.pod_ref().is_none() {
            return Err(Error::configuration(
                "kubernetes target requires a pod or a selector",
            ));
        }
        Ok(())
    }
}
