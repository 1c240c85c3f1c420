//! Per-call execution context passed from the engine to an adapter

use async_channel::{Receiver, Sender};
use futures_lite::future;
use smol::Timer;
use std::time::{Duration, Instant};

use crate::descriptor::CommandDescriptor;
use crate::error::Deadline;
use crate::event::OutputChunk;
use crate::stream::{DEFAULT_MAX_BUFFER, Encoding};

/// Default wait between the graceful signal and the forced kill
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Create a linked cancel handle and signal
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = async_channel::bounded(1);
    let handle = CancelHandle { tx: tx.clone() };
    let signal = CancelSignal { rx, _keep_open: tx };
    (handle, signal)
}

/// Cancels every execution holding the paired [`CancelSignal`]
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Sender<()>,
}

impl CancelHandle {
    /// Cancel; idempotent
    pub fn cancel(&self) {
        self.tx.close();
    }
}

/// Resolves once the paired [`CancelHandle`] is cancelled
///
/// Dropping the handle without calling `cancel` does not cancel.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Receiver<()>,
    _keep_open: Sender<()>,
}

impl CancelSignal {
    /// Returns true once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.rx.is_closed()
    }

    /// Wait until cancelled
    pub async fn cancelled(&self) {
        while self.rx.recv().await.is_ok() {}
    }
}

/// Everything an adapter needs to run one attempt
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Deadline for the attempt, measured from `started`
    pub timeout: Option<Duration>,
    /// Wait between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// Limit for each of stdout and stderr
    pub max_buffer: usize,
    /// Output decoding
    pub encoding: Encoding,
    /// Explicit cancellation
    pub cancel: Option<CancelSignal>,
    /// Live output sink; a full channel pauses output draining
    pub output: Option<Sender<OutputChunk>>,
    /// When the attempt started
    pub started: Instant,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            timeout: None,
            kill_grace: DEFAULT_KILL_GRACE,
            max_buffer: DEFAULT_MAX_BUFFER,
            encoding: Encoding::default(),
            cancel: None,
            output: None,
            started: Instant::now(),
        }
    }
}

impl ExecContext {
    /// Context with a timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Restart the clock for a new attempt
    pub fn restarted(&self) -> Self {
        Self {
            started: Instant::now(),
            ..self.clone()
        }
    }

    /// Context whose timeout is the descriptor's, when it sets one
    pub(crate) fn for_descriptor(&self, descriptor: &CommandDescriptor) -> Self {
        Self {
            timeout: descriptor.get_timeout().or(self.timeout),
            ..self.clone()
        }
    }

    /// Resolves when the deadline passes or the call is cancelled
    pub(crate) async fn stopped(&self) -> Deadline {
        let elapsed = async {
            match self.timeout {
                Some(timeout) => {
                    match self.started.checked_add(timeout) {
                        Some(at) => {
                            Timer::at(at).await;
                        }
                        None => future::pending::<()>().await,
                    }
                    Deadline::Elapsed(timeout)
                }
                None => future::pending().await,
            }
        };
        let cancelled = async {
            match &self.cancel {
                Some(signal) => {
                    signal.cancelled().await;
                    Deadline::Cancelled
                }
                None => future::pending().await,
            }
        };
        future::or(cancelled, elapsed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_cancel_resolves_signal() {
        let (handle, signal) = cancellation();
        assert!(!signal.is_cancelled());

        let ctx = ExecContext {
            cancel: Some(signal.clone()),
            ..ExecContext::default()
        };
        handle.cancel();
        handle.cancel();
        assert!(signal.is_cancelled());
        assert_eq!(ctx.stopped().await, Deadline::Cancelled);
    }

    #[smol_potat::test]
    async fn test_dropping_handle_does_not_cancel() {
        let (handle, signal) = cancellation();
        drop(handle);
        assert!(!signal.is_cancelled());

        let ctx = ExecContext {
            timeout: Some(Duration::from_millis(20)),
            cancel: Some(signal),
            ..ExecContext::default()
        };
        assert_eq!(
            ctx.stopped().await,
            Deadline::Elapsed(Duration::from_millis(20))
        );
    }

    #[smol_potat::test]
    async fn test_unbounded_timeout_waits_for_cancel() {
        let (handle, signal) = cancellation();
        let ctx = ExecContext {
            cancel: Some(signal),
            ..ExecContext::with_timeout(Duration::MAX)
        };
        handle.cancel();
        assert_eq!(ctx.stopped().await, Deadline::Cancelled);
    }
}
