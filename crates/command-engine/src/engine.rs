//! Dispatch engine
//!
//! The engine picks an adapter from the descriptor's target, applies the
//! configured timeout and retry policy around the whole call, and hands back
//! one result or one classified error.

use async_channel::Sender;
use futures_lite::future;
use smol::Timer;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adapters::{
    Adapter, DockerAdapter, KubernetesAdapter, LocalAdapter, SshAdapter, SshConnection,
    TransferOptions,
};
use crate::config::EngineConfig;
use crate::context::{CancelSignal, ExecContext};
use crate::descriptor::{AdapterOptions, CommandDescriptor};
use crate::error::{Deadline, Error, Result};
use crate::event::OutputChunk;
use crate::pool::{ConnectionPool, PoolStats};
use crate::result::ExecutionResult;
use crate::stdin::Stdin;

/// Extra wait past timeout plus kill grace before the engine gives up on an adapter
const STOP_SLACK: Duration = Duration::from_millis(500);

/// Cached adapters kept before unused ones are dropped
const ADAPTER_CACHE_LIMIT: usize = 64;

/// Per-call controls beyond the descriptor
#[derive(Debug, Clone, Default)]
pub struct ExecControl {
    /// Cancels the call when triggered
    pub cancel: Option<CancelSignal>,
    /// Receives output while the command runs
    pub output: Option<Sender<OutputChunk>>,
}

/// Where a call is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Accepted, not yet validated
    Pending,
    /// Choosing or creating the adapter
    Resolving,
    /// An attempt is running
    Executing,
    /// Returned a result
    Completed,
    /// Returned an error other than a timeout
    Failed,
    /// Timed out or was cancelled
    TimedOut,
}

struct Call {
    id: u64,
    state: CallState,
    started: Instant,
}

impl Call {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: CallState::Pending,
            started: Instant::now(),
        }
    }

    fn transition(&mut self, next: CallState) {
        debug!(call = self.id, from = ?self.state, to = ?next, "call state changed");
        self.state = next;
    }

    fn fail(&mut self, error: &Error) {
        let next = if matches!(error, Error::Timeout { .. }) {
            CallState::TimedOut
        } else {
            CallState::Failed
        };
        self.transition(next);
    }
}

/// Runs command descriptors on any supported target
pub struct Engine {
    config: EngineConfig,
    ssh_pool: ConnectionPool<SshConnection>,
    adapters: Mutex<HashMap<AdapterOptions, Arc<dyn Adapter>>>,
    next_call: AtomicU64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("ssh_pool", &self.ssh_pool)
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::build(EngineConfig::default())
    }
}

impl Engine {
    /// Create an engine after validating `config`
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        Self {
            ssh_pool: ConnectionPool::new(config.ssh.clone()),
            adapters: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            config,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Adapter for `options`, reused where configured
    ///
    /// SSH adapters are always shared since their connections live in the
    /// engine's pool. Invalid options fail here, before any I/O.
    ///
    /// Once the cache holds `ADAPTER_CACHE_LIMIT` adapters, those no call is
    /// using are dropped. Their connections stay in the pool, so nothing is
    /// lost but the handle.
    pub fn adapter(&self, options: &AdapterOptions) -> Result<Arc<dyn Adapter>> {
        let shared = matches!(options, AdapterOptions::Ssh(_)) || self.config.reuse_adapters;
        if shared {
            let adapters = self.adapters.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(adapter) = adapters.get(options) {
                return Ok(adapter.clone());
            }
        }

        let binaries = &self.config.binaries;
        let adapter: Arc<dyn Adapter> = match options {
            AdapterOptions::Local(_) => Arc::new(LocalAdapter::with_binaries(binaries)),
            AdapterOptions::Ssh(ssh) => Arc::new(SshAdapter::new(
                ssh.clone(),
                self.ssh_pool.clone(),
                binaries,
            )?),
            AdapterOptions::Docker(docker) => {
                Arc::new(DockerAdapter::new(docker.clone(), binaries)?)
            }
            AdapterOptions::Kubernetes(kubernetes) => {
                Arc::new(KubernetesAdapter::new(kubernetes.clone(), binaries)?)
            }
        };

        if shared {
            let mut adapters = self.adapters.lock().unwrap_or_else(PoisonError::into_inner);
            if adapters.len() >= ADAPTER_CACHE_LIMIT && !adapters.contains_key(options) {
                let before = adapters.len();
                adapters.retain(|_, cached| Arc::strong_count(cached) > 1);
                debug!(dropped = before - adapters.len(), "trimmed adapter cache");
            }
            // another caller may have raced us here; keep the first one
            let adapter = adapters.entry(options.clone()).or_insert(adapter);
            return Ok(adapter.clone());
        }
        Ok(adapter)
    }

    /// Run a descriptor to completion
    pub async fn execute(&self, descriptor: &CommandDescriptor) -> Result<ExecutionResult> {
        self.execute_with(descriptor, ExecControl::default()).await
    }

    /// Run a descriptor with cancellation and live output
    pub async fn execute_with(
        &self,
        descriptor: &CommandDescriptor,
        control: ExecControl,
    ) -> Result<ExecutionResult> {
        let mut call = Call::new(self.next_call.fetch_add(1, Ordering::Relaxed));

        if let Err(e) = descriptor.validate() {
            call.fail(&e);
            return Err(e);
        }
        call.transition(CallState::Resolving);
        let adapter = match self.adapter(descriptor.adapter_options()) {
            Ok(adapter) => adapter,
            Err(e) => {
                call.fail(&e);
                return Err(e);
            }
        };

        let ctx = ExecContext {
            timeout: descriptor.get_timeout().or(self.config.default_timeout()),
            kill_grace: self.config.kill_grace(),
            max_buffer: self.config.max_buffer_bytes,
            encoding: self.config.encoding,
            cancel: control.cancel,
            output: control.output,
            started: Instant::now(),
        };
        let policy = &self.config.retry;
        let replayable = descriptor.get_stdin().is_none_or(Stdin::is_replayable);

        let mut attempt = 1;
        loop {
            call.transition(CallState::Executing);
            let outcome = self.attempt(adapter.as_ref(), descriptor, &ctx.restarted()).await;

            let error = match outcome {
                Ok(result) => {
                    call.transition(CallState::Completed);
                    debug!(
                        call = call.id,
                        adapter = adapter.name(),
                        exit_code = ?result.exit_code,
                        elapsed_ms = call.started.elapsed().as_millis() as u64,
                        "command finished"
                    );
                    return Ok(result);
                }
                Err(e) => e,
            };

            if !replayable || !policy.should_retry(&error, attempt) {
                call.fail(&error);
                return Err(error);
            }

            let delay = policy.delay_for(attempt);
            warn!(
                call = call.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            let cancelled = future::or(
                async {
                    Timer::after(delay).await;
                    false
                },
                async {
                    match &ctx.cancel {
                        Some(signal) => {
                            signal.cancelled().await;
                            true
                        }
                        None => future::pending().await,
                    }
                },
            )
            .await;
            if cancelled {
                call.fail(&error);
                return Err(error);
            }
            attempt += 1;
        }
    }

    /// One attempt, bounded even if the adapter fails to stop on its own
    async fn attempt(
        &self,
        adapter: &dyn Adapter,
        descriptor: &CommandDescriptor,
        ctx: &ExecContext,
    ) -> Result<ExecutionResult> {
        if ctx.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(Error::Timeout {
                command: descriptor.to_string(),
                deadline: Deadline::Cancelled,
                partial: Default::default(),
            });
        }

        let fallback = async {
            let deadline = ctx.stopped().await;
            Timer::after(ctx.kill_grace + STOP_SLACK).await;
            warn!(command = %descriptor, %deadline, "adapter did not stop in time");
            Err(Error::Timeout {
                command: descriptor.to_string(),
                deadline,
                partial: Default::default(),
            })
        };
        future::or(adapter.execute(descriptor, ctx), fallback).await
    }

    /// Probe the target; false for invalid options
    pub async fn is_available(&self, options: &AdapterOptions) -> bool {
        match self.adapter(options) {
            Ok(adapter) => adapter.is_available().await,
            Err(e) => {
                debug!(error = %e, "cannot probe target");
                false
            }
        }
    }

    /// Copy a local file to the target
    pub async fn upload_file(
        &self,
        options: &AdapterOptions,
        local: &Path,
        remote: &str,
        transfer: &TransferOptions,
    ) -> Result<()> {
        self.adapter(options)?
            .upload_file(local, remote, transfer)
            .await
    }

    /// Copy a file from the target to a local path
    pub async fn download_file(
        &self,
        options: &AdapterOptions,
        remote: &str,
        local: &Path,
        transfer: &TransferOptions,
    ) -> Result<()> {
        self.adapter(options)?
            .download_file(remote, local, transfer)
            .await
    }

    /// SSH pool counters
    pub fn ssh_pool_stats(&self) -> PoolStats {
        self.ssh_pool.stats()
    }

    /// Dispose every adapter and close the SSH pool; idempotent
    pub async fn dispose(&self) -> Result<()> {
        let adapters: Vec<Arc<dyn Adapter>> = self
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, adapter)| adapter)
            .collect();
        if !adapters.is_empty() {
            info!(count = adapters.len(), "disposing adapters");
        }
        for adapter in adapters {
            if let Err(e) = adapter.dispose().await {
                warn!(adapter = adapter.name(), error = %e, "failed to dispose adapter");
            }
        }
        self.ssh_pool.dispose().await;
        Ok(())
    }
}
