//! Map transport failures onto the error taxonomy
//!
//! Every adapter spawns a local client (`ssh`, `docker`, `kubectl`) whose
//! non-zero exit may mean the remote command failed, or that the client never
//! reached the command at all. The functions here separate the two: a
//! transport failure becomes an error, anything else passes through to be
//! judged as a command result.

use std::io;

use crate::error::{Error, ResourceKind};
use crate::result::ExecutionResult;

/// Exit status the OpenSSH client reserves for its own errors
pub(crate) const SSH_CLIENT_ERROR: i32 = 255;

/// Map an error from spawning a local program
pub(crate) fn spawn_error(err: &io::Error, program: &str) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::not_found(ResourceKind::Program, program),
        io::ErrorKind::PermissionDenied => {
            Error::configuration(format!("{} is not executable: {}", program, err))
        }
        _ => Error::connection("localhost", format!("failed to spawn {}: {}", program, err)),
    }
}

/// Separate ssh client failures from remote command failures
///
/// A remote command may exit with 255 itself, so that status only counts as
/// a transport failure when the connection is gone as well.
pub(crate) fn ssh(
    result: ExecutionResult,
    target: &str,
    connection_alive: bool,
) -> Result<ExecutionResult, Error> {
    if result.exit_code == Some(SSH_CLIENT_ERROR) && !connection_alive {
        return Err(Error::connection(target, reason(&result, "ssh exited with 255")));
    }
    Ok(result)
}

/// Separate docker client and daemon failures from command failures
pub(crate) fn docker(result: ExecutionResult, container: &str) -> Result<ExecutionResult, Error> {
    if result.success() {
        return Ok(result);
    }
    let stderr = result.stderr.trim_start();
    if stderr.starts_with("Error response from daemon: No such container")
        || stderr.starts_with("Error: No such container")
    {
        return Err(Error::not_found(ResourceKind::Container, container));
    }
    if stderr.contains("Cannot connect to the Docker daemon") {
        return Err(Error::connection(
            "docker daemon",
            reason(&result, "daemon unreachable"),
        ));
    }
    Ok(result)
}

/// Separate kubectl and API server failures from command failures
pub(crate) fn kubectl(result: ExecutionResult, pod: &str) -> Result<ExecutionResult, Error> {
    if result.success() {
        return Ok(result);
    }
    let stderr = result.stderr.trim_start();
    if stderr.starts_with("Error from server (NotFound)") {
        return Err(Error::not_found(ResourceKind::Pod, pod));
    }
    if is_api_unreachable(stderr) {
        return Err(Error::connection(
            "kubernetes api server",
            reason(&result, "api server unreachable"),
        ));
    }
    Ok(result)
}

/// Returns true if kubectl output says the API server could not be reached
pub(crate) fn is_api_unreachable(stderr: &str) -> bool {
    stderr.contains("Unable to connect to the server")
        || (stderr.contains("connection to the server") && stderr.contains("refused"))
}

fn reason(result: &ExecutionResult, fallback: &str) -> String {
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        fallback.to_string()
    } else {
        stderr.to_string()
    }
}
