//! SSH adapter built on OpenSSH connection multiplexing
//!
//! A pooled connection is an `ssh -M` control master listening on a private
//! socket. Commands run as `ssh -S <socket>` clients that open a channel on the
//! master instead of a new TCP connection, and SFTP transfers ride the same
//! master. Keep-alive is `ssh -O check`, close is `ssh -O exit`.

use async_process::{Child, Stdio};
use async_trait::async_trait;
use futures_lite::{AsyncReadExt, future};
use smol::Timer;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::{Adapter, TransferOptions, finish, probe, run_transfer};
use crate::classify;
use crate::command::Command;
use crate::config::{Binaries, PoolConfig};
use crate::context::ExecContext;
use crate::descriptor::{CommandDescriptor, SshOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::pool::{ConnectionPool, Lease, PoolKey, PooledConnection};
use crate::process::{self, Invocation};
use crate::result::ExecutionResult;
use crate::shell;
use crate::stdin::Stdin;

const READY_POLL: Duration = Duration::from_millis(50);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Builds ssh and sftp client invocations for one target
#[derive(Debug, Clone)]
struct SshTransport {
    options: SshOptions,
    binaries: Binaries,
    connect_timeout: Duration,
}

impl SshTransport {
    fn target(&self) -> String {
        format!("{}:{}", self.options.destination(), self.options.port())
    }

    /// The client program, behind `sshpass` when a password is configured
    fn client(&self, program: &Path) -> Command {
        match &self.options.password {
            Some(password) => {
                let mut command = Command::new(&self.binaries.sshpass);
                command.arg("-e").arg(program).env("SSHPASS", password);
                command
            }
            None => Command::new(program),
        }
    }

    /// Options shared by ssh and sftp
    fn common_options(&self, command: &mut Command) {
        let connect_secs = self.connect_timeout.as_secs().max(1);
        command
            .arg("-o")
            .arg(format!("ConnectTimeout={}", connect_secs))
            .arg("-o")
            .arg("LogLevel=ERROR");

        if self.options.password.is_none() {
            command.arg("-o").arg("BatchMode=yes");
        } else {
            command.arg("-o").arg("NumberOfPasswordPrompts=1");
        }

        match self.options.strict_host_key_checking {
            Some(true) => {
                command.arg("-o").arg("StrictHostKeyChecking=yes");
            }
            Some(false) => {
                command
                    .arg("-o")
                    .arg("StrictHostKeyChecking=no")
                    .arg("-o")
                    .arg("UserKnownHostsFile=/dev/null");
            }
            None => {}
        }

        if let Some(key) = &self.options.private_key {
            command.arg("-i").arg(key).arg("-o").arg("IdentitiesOnly=yes");
        }
    }

    fn ssh(&self) -> Command {
        let mut command = self.client(&self.binaries.ssh);
        self.common_options(&mut command);
        command.arg("-p").arg(self.options.port().to_string());
        command.args(&self.options.extra_args);
        command
    }

    /// Control master that holds the TCP connection
    fn master(&self, socket: &Path) -> Command {
        let mut command = self.ssh();
        command
            .args(["-M", "-N", "-o", "ControlMaster=yes", "-o", "ControlPersist=no", "-S"])
            .arg(socket)
            .arg(self.options.destination());
        command
    }

    /// A command channel on an existing master
    fn channel(&self, socket: &Path, remote: &str) -> Command {
        let mut command = self.ssh();
        command
            .arg("-S")
            .arg(socket)
            .args(["-o", "ControlMaster=no"])
            .arg(self.options.destination())
            .arg(remote);
        command
    }

    /// A control request (`check`, `exit`) to a master
    fn control(&self, socket: &Path, operation: &str) -> Command {
        let mut command = Command::new(&self.binaries.ssh);
        command
            .arg("-S")
            .arg(socket)
            .arg("-O")
            .arg(operation)
            .arg(self.options.destination());
        command
    }

    /// A command on its own connection, bypassing any master
    fn one_shot(&self, remote: &str) -> Command {
        let mut command = self.ssh();
        command.arg(self.options.destination()).arg(remote);
        command
    }

    /// An sftp batch session reading commands from stdin
    fn sftp(&self, socket: &Path, preserve: bool) -> Command {
        let mut command = self.client(&self.binaries.sftp);
        self.common_options(&mut command);
        command
            .arg("-o")
            .arg(format!("ControlPath={}", socket.display()))
            .args(["-o", "ControlMaster=no"])
            .arg("-P")
            .arg(self.options.port().to_string());
        if preserve {
            command.arg("-p");
        }
        command.args(["-b", "-"]).arg(self.options.destination());
        command
    }
}

/// A live control master
pub struct SshConnection {
    transport: SshTransport,
    socket: PathBuf,
    dir: Mutex<Option<TempDir>>,
    master: Mutex<Option<Child>>,
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnection")
            .field("target", &self.transport.target())
            .field("socket", &self.socket)
            .finish()
    }
}

impl SshConnection {
    /// Start a control master and wait until it accepts channels
    async fn open(transport: SshTransport) -> Result<Self> {
        let target = transport.target();
        let dir = tempfile::Builder::new()
            .prefix("ssh-mux-")
            .tempdir()
            .map_err(|e| {
                Error::connection(&target, format!("failed to create control directory: {}", e))
            })?;
        let socket = dir.path().join("control");

        let master = transport.master(&socket);
        let mut cmd = master.prepare();
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| classify::spawn_error(&e, &master.get_program().to_string_lossy()))?;
        debug!(%target, pid = child.id(), "starting ssh control master");

        let started = Instant::now();
        loop {
            let exited = child
                .try_status()
                .map_err(|e| Error::connection(&target, format!("lost ssh master: {}", e)))?;
            if let Some(status) = exited {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let stderr = stderr.trim();
                let reason = if stderr.is_empty() {
                    format!("ssh master exited with {}", status)
                } else {
                    stderr.to_string()
                };
                return Err(Error::connection(&target, reason));
            }

            if socket.exists() && probe(transport.control(&socket, "check"), "ssh").await {
                break;
            }
            Timer::after(READY_POLL).await;
        }

        // keep draining so a chatty master never blocks on a full pipe
        if let Some(mut pipe) = child.stderr.take() {
            smol::spawn(async move {
                let _ = futures::io::copy(&mut pipe, &mut futures::io::sink()).await;
            })
            .detach();
        }

        info!(
            %target,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ssh connection established"
        );
        Ok(Self {
            transport,
            socket,
            dir: Mutex::new(Some(dir)),
            master: Mutex::new(Some(child)),
        })
    }

    /// Run one command line on a new channel
    async fn exec(
        &self,
        remote: &str,
        descriptor: &CommandDescriptor,
        ctx: &ExecContext,
    ) -> Result<ExecutionResult> {
        let target = self.transport.target();
        let invocation = Invocation {
            command: self.transport.channel(&self.socket, remote),
            display: descriptor.to_string(),
            stdin: descriptor.get_stdin(),
            adapter: "ssh",
            host: Some(format!("{}:{}", self.transport.options.host, self.transport.options.port())),
        };
        let result = process::run(invocation, ctx).await?;
        let alive =
            result.exit_code != Some(classify::SSH_CLIENT_ERROR) || self.is_alive().await;
        classify::ssh(result, &target, alive)
    }

    fn master_running(&self) -> bool {
        let mut master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        match master.as_mut() {
            Some(child) => matches!(child.try_status(), Ok(None)),
            None => false,
        }
    }
}

#[async_trait]
impl PooledConnection for SshConnection {
    async fn is_alive(&self) -> bool {
        self.master_running() && probe(self.transport.control(&self.socket, "check"), "ssh").await
    }

    async fn close(&self) {
        let target = self.transport.target();
        if self.master_running() && !probe(self.transport.control(&self.socket, "exit"), "ssh").await
        {
            debug!(%target, "ssh master did not accept exit request");
        }

        let master = self
            .master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = master {
            process::terminate(&mut child, CLOSE_GRACE).await;
        }
        self.dir.lock().unwrap_or_else(PoisonError::into_inner).take();
        debug!(%target, "ssh connection closed");
    }
}

/// Runs commands on a remote host over pooled SSH connections
pub struct SshAdapter {
    transport: SshTransport,
    key: PoolKey,
    pool: ConnectionPool<SshConnection>,
}

impl fmt::Debug for SshAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshAdapter")
            .field("options", &self.transport.options)
            .field("key", &self.key)
            .finish()
    }
}

impl SshAdapter {
    /// Adapter for one target, sharing `pool` with other SSH adapters
    pub fn new(
        options: SshOptions,
        pool: ConnectionPool<SshConnection>,
        binaries: &Binaries,
    ) -> Result<Self> {
        options.validate()?;
        let key = PoolKey {
            host: options.host.clone(),
            port: options.port(),
            username: options.username.clone(),
            auth: auth_fingerprint(&options),
        };
        let transport = SshTransport {
            connect_timeout: pool.config().connect_timeout(),
            options,
            binaries: binaries.clone(),
        };
        Ok(Self {
            transport,
            key,
            pool,
        })
    }

    /// Adapter with a private pool and default client programs
    pub fn standalone(options: SshOptions) -> Result<Self> {
        Self::new(
            options,
            ConnectionPool::new(PoolConfig::default()),
            &Binaries::default(),
        )
    }

    /// Key of this adapter's connections in the pool
    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    /// The pool this adapter draws from
    pub fn pool(&self) -> &ConnectionPool<SshConnection> {
        &self.pool
    }

    async fn lease(&self) -> Result<Lease<SshConnection>> {
        let transport = &self.transport;
        self.pool
            .acquire(&self.key, || SshConnection::open(transport.clone()))
            .await
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.transport.target(), path)
    }

    async fn sftp(
        &self,
        batch: String,
        origin: &str,
        destination: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        let mut lease = self
            .lease()
            .await
            .map_err(|e| Error::transfer(origin, destination, e.to_string()))?;
        let command = self
            .transport
            .sftp(&lease.socket, options.preserve_attributes);
        let stdin = Stdin::Text(batch);
        let copied = run_transfer(command, Some(&stdin), "ssh", origin, destination, options).await;
        if copied.is_err() && !lease.is_alive().await {
            lease.mark_failed();
        }
        copied
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn is_available(&self) -> bool {
        probe(self.transport.one_shot("true"), self.name()).await
    }

    async fn execute(
        &self,
        descriptor: &CommandDescriptor,
        ctx: &ExecContext,
    ) -> Result<ExecutionResult> {
        descriptor.validate()?;
        let ctx = ctx.for_descriptor(descriptor);
        let remote = shell::with_context(
            &descriptor.to_shell_string(),
            descriptor.get_cwd(),
            descriptor.get_env(),
        );

        let acquired = future::or(async { Ok(self.lease().await) }, async {
            Err(ctx.stopped().await)
        })
        .await;
        let mut lease = match acquired {
            Ok(lease) => lease?,
            Err(deadline) => {
                return Err(Error::Timeout {
                    command: descriptor.to_string(),
                    deadline,
                    partial: Default::default(),
                });
            }
        };
        debug!(key = %self.key, connection = lease.id(), command = %descriptor, "executing over ssh");

        let outcome = lease.exec(&remote, descriptor, &ctx).await;
        if let Err(e) = &outcome {
            if e.kind() == ErrorKind::Connection {
                warn!(key = %self.key, error = %e, "ssh connection failed during use");
                lease.mark_failed();
            }
        }
        drop(lease);
        finish(outcome?, descriptor)
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        let origin = local.display().to_string();
        let destination = self.remote_spec(remote);
        let flag = if options.preserve_attributes { "-p " } else { "" };
        let batch = format!(
            "put {}{} {}\n",
            flag,
            shell::sftp_quote(&origin),
            shell::sftp_quote(remote)
        );
        self.sftp(batch, &origin, &destination, options).await
    }

    async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<()> {
        let origin = self.remote_spec(remote);
        let destination = local.display().to_string();
        let flag = if options.preserve_attributes { "-p " } else { "" };
        let batch = format!(
            "get {}{} {}\n",
            flag,
            shell::sftp_quote(remote),
            shell::sftp_quote(&destination)
        );
        self.sftp(batch, &origin, &destination, options).await
    }

    async fn dispose(&self) -> Result<()> {
        self.pool.drain_key(&self.key).await;
        Ok(())
    }
}

/// Separates pool keys for the same endpoint reached with different credentials
fn auth_fingerprint(options: &SshOptions) -> Option<String> {
    match (&options.private_key, &options.password) {
        (Some(key), _) => Some(format!("key:{}", key.display())),
        (None, Some(password)) => {
            let mut hasher = DefaultHasher::new();
            password.hash(&mut hasher);
            Some(format!("password:{:016x}", hasher.finish()))
        }
        (None, None) => None,
    }
}
