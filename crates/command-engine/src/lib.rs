//! Runtime-agnostic command execution engine
//!
//! One command description runs on any of four targets: a local process, a
//! remote host over SSH, a Docker container, or a Kubernetes pod. Callers get
//! back the same [`ExecutionResult`], or one classified [`Error`], whichever
//! transport carried the command.
//!
//! ```no_run
//! use command_engine::{CommandDescriptor, Engine, SshOptions};
//!
//! # async fn run() -> command_engine::Result<()> {
//! let engine = Engine::default();
//!
//! let local = engine.execute(&CommandDescriptor::new("echo").arg("hi")).await?;
//! assert_eq!(local.stdout, "hi\n");
//!
//! let remote = engine
//!     .execute(
//!         &CommandDescriptor::new("exit 42")
//!             .shell(true)
//!             .nothrow(true)
//!             .on(SshOptions::new("db.internal", "deploy")),
//!     )
//!     .await?;
//! assert_eq!(remote.exit_code, Some(42));
//!
//! engine.dispose().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod adapters;
mod classify;
pub mod command;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod event;
pub mod pool;
mod process;
pub mod result;
pub mod shell;
pub mod stdin;
pub mod stream;

pub use adapters::{
    Adapter, DockerAdapter, KubernetesAdapter, LocalAdapter, SshAdapter, SshConnection,
    TransferOptions,
};
pub use command::Command;
pub use config::{Binaries, EngineConfig, PoolConfig, RetryPolicy};
pub use context::{CancelHandle, CancelSignal, ExecContext, cancellation};
pub use descriptor::{
    AdapterOptions, CommandDescriptor, DockerOptions, KubernetesOptions, LocalOptions, PodRef,
    SshOptions,
};
pub use engine::{CallState, Engine, ExecControl};
pub use error::{Deadline, Error, ErrorKind, PartialOutput, ResourceKind, Result};
pub use event::{OutputChunk, OutputSource};
pub use pool::{ConnectionPool, ConnectionState, Lease, PoolKey, PoolStats, PooledConnection};
pub use result::ExecutionResult;
pub use stdin::{Stdin, StdinStream};
pub use stream::{DEFAULT_MAX_BUFFER, Encoding, StreamError, StreamHandler};
