//! Running one local process to completion
//!
//! Stdin forwarding and the stdout/stderr drains run concurrently on the same
//! task. Each stream is accumulated by its own [`StreamHandler`]; decoded
//! chunks are also pushed into the optional live sink, whose bounded channel
//! pauses draining while the consumer is behind.
//!
//! A deadline or cancellation sends SIGTERM to the process group, waits for the
//! grace window, then escalates to SIGKILL and reaps the child.

use async_channel::Sender;
use async_process::{Child, Stdio};
use chrono::Utc;
use futures::io::AsyncRead;
use futures_lite::{AsyncReadExt, future};
use smol::Timer;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::classify;
use crate::command::Command;
use crate::context::ExecContext;
use crate::error::{Error, PartialOutput, Result};
use crate::event::{OutputChunk, OutputSource};
use crate::result::ExecutionResult;
use crate::stdin::{self, Stdin};
use crate::stream::{StreamError, StreamHandler};

const CHUNK_SIZE: usize = 8 * 1024;

/// A local process to run on behalf of an adapter
pub(crate) struct Invocation<'a> {
    /// The program to spawn
    pub command: Command,
    /// The caller's command, used in errors
    pub display: String,
    /// Input for the process
    pub stdin: Option<&'a Stdin>,
    /// Adapter name recorded in the result
    pub adapter: &'static str,
    /// Remote endpoint recorded in the result
    pub host: Option<String>,
}

enum Failure {
    Overflow(StreamError),
    Wait(io::Error),
}

enum Outcome {
    Exited(std::result::Result<std::process::ExitStatus, Failure>),
    Stopped(crate::error::Deadline),
}

/// Spawn the process and collect its output
pub(crate) async fn run(invocation: Invocation<'_>, ctx: &ExecContext) -> Result<ExecutionResult> {
    let Invocation {
        command,
        display: shown,
        stdin,
        adapter,
        host,
    } = invocation;

    // take a stream before spawning so a consumed one fails without I/O
    let source = stdin.map(Stdin::open).transpose()?;

    let mut async_cmd = command.prepare();
    async_cmd.stdout(Stdio::piped());
    async_cmd.stderr(Stdio::piped());
    async_cmd.stdin(if source.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let started_at = Utc::now();
    let clock = Instant::now();
    let mut child = async_cmd
        .spawn()
        .map_err(|e| classify::spawn_error(&e, &command.get_program().to_string_lossy()))?;
    let pid = child.id();
    debug!(pid, adapter, command = %shown, "spawned process");

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdin_pipe = child.stdin.take();

    let mut stdout = StreamHandler::new(ctx.max_buffer, ctx.encoding);
    let mut stderr = StreamHandler::new(ctx.max_buffer, ctx.encoding);

    let outcome = {
        let child = &mut child;
        let stdout = &mut stdout;
        let stderr = &mut stderr;
        let work = async move {
            let feed = async {
                if let (Some(pipe), Some(source)) = (stdin_pipe, source) {
                    if let Err(e) = stdin::forward(pipe, source).await {
                        debug!(pid, error = %e, "stdin forwarding stopped early");
                    }
                }
                Ok::<(), StreamError>(())
            };
            // an overflow on either stream stops the other drains early
            futures::try_join!(
                feed,
                drain(stdout_pipe, stdout, OutputSource::Stdout, ctx.output.clone()),
                drain(stderr_pipe, stderr, OutputSource::Stderr, ctx.output.clone()),
            )
            .map_err(Failure::Overflow)?;
            child.status().await.map_err(Failure::Wait)
        };
        future::or(async { Outcome::Exited(work.await) }, async {
            Outcome::Stopped(ctx.stopped().await)
        })
        .await
    };

    let duration = clock.elapsed();
    let result = |stdout: String, stderr: String, status: Option<std::process::ExitStatus>| {
        let (exit_code, signal) = status.map(exit_parts).unwrap_or((None, None));
        ExecutionResult {
            stdout,
            stderr,
            exit_code,
            signal,
            duration,
            adapter: adapter.to_string(),
            host: host.clone(),
            started_at,
        }
    };

    match outcome {
        Outcome::Exited(Ok(status)) => {
            let out = stdout.take_content();
            let err = stderr.take_content();
            stdout.dispose();
            stderr.dispose();
            debug!(pid, code = ?status.code(), "process exited");
            Ok(result(out, err, Some(status)))
        }
        Outcome::Exited(Err(Failure::Overflow(e))) => {
            warn!(pid, error = %e, "output limit exceeded, stopping process");
            let status = terminate(&mut child, ctx.kill_grace).await;
            stdout.dispose();
            stderr.dispose();
            Err(Error::Command {
                command: shown,
                result: Box::new(result(String::new(), String::new(), status)),
                reason: Some(e.to_string()),
            })
        }
        Outcome::Exited(Err(Failure::Wait(e))) => {
            stdout.dispose();
            stderr.dispose();
            Err(Error::connection(
                host.as_deref().unwrap_or("localhost"),
                format!("failed to wait for process: {}", e),
            ))
        }
        Outcome::Stopped(deadline) => {
            warn!(pid, command = %shown, %deadline, "stopping process");
            let partial = PartialOutput {
                stdout: stdout.take_content(),
                stderr: stderr.take_content(),
            };
            stdout.dispose();
            stderr.dispose();
            terminate(&mut child, ctx.kill_grace).await;
            Err(Error::Timeout {
                command: shown,
                deadline,
                partial,
            })
        }
    }
}

/// Read a pipe to EOF through `handler`, forwarding decoded chunks to `sink`
async fn drain<R>(
    pipe: Option<R>,
    handler: &mut StreamHandler,
    source: OutputSource,
    mut sink: Option<Sender<OutputChunk>>,
) -> std::result::Result<(), StreamError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(());
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Error reading the pipe, treat it as closed
                debug!(?source, error = %e, "output pipe read failed");
                break;
            }
        };
        let text = handler.write(&buf[..n])?;
        forward(&mut sink, source, text).await;
    }

    let tail = handler.flush()?;
    forward(&mut sink, source, tail).await;
    Ok(())
}

async fn forward(sink: &mut Option<Sender<OutputChunk>>, source: OutputSource, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(tx) = sink {
        // awaiting a full channel is the backpressure point
        if tx.send(OutputChunk::new(source, text)).await.is_err() {
            *sink = None;
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL; always reaps the child
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    let pid = child.id();
    signal_group(child, Signal::Terminate);

    let graceful = future::or(async { child.status().await.ok() }, async {
        Timer::after(grace).await;
        None
    })
    .await;
    if graceful.is_some() {
        debug!(pid, "process stopped after SIGTERM");
        return graceful;
    }

    warn!(pid, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, sending SIGKILL");
    signal_group(child, Signal::Kill);
    let _ = child.kill();
    child.status().await.ok()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

fn signal_group(child: &mut Child, signal: Signal) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal as NixSignal};
        use nix::unistd::Pid;

        let sig = match signal {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };
        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = signal::killpg(pgid, sig) {
            // ESRCH: the whole group is already gone
            if e != nix::errno::Errno::ESRCH {
                warn!(pid = child.id(), error = %e, ?sig, "failed to signal process group");
                let _ = signal::kill(pgid, sig);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal;
        let _ = child.kill();
    }
}

fn exit_parts(status: std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal().map(signal_name))
    }

    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

/// Name for a signal number, e.g. `SIGTERM`
#[cfg(unix)]
pub(crate) fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}
