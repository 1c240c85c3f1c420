//! Common test utilities
//!
//! `Stubs` writes small shell scripts standing in for `ssh`, `sftp`,
//! `docker` and `kubectl` so the adapters can be exercised without a daemon
//! or a remote host. Each stub appends its arguments to a log in the same
//! directory.

#![allow(dead_code)]

use anyhow::{Context, Result};
use command_engine::{Binaries, EngineConfig};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SSH: &str = r#"#!/bin/sh
log="__DIR__/ssh.log"
sock=""
op=""
master=0
prev=""
for arg in "$@"; do
  case "$prev" in
    -S) sock="$arg" ;;
    -O) op="$arg" ;;
  esac
  case "$arg" in
    -M) master=1 ;;
    *@unreachable)
      echo "ssh: connect to host unreachable port 22: Connection refused" >&2
      exit 255 ;;
  esac
  prev="$arg"
done
for last; do :; done

if [ -n "$op" ]; then
  echo "control $op" >> "$log"
  case "$op" in
    check) [ -e "$sock" ]; exit $? ;;
    exit) rm -f "$sock"; exit 0 ;;
  esac
  exit 1
fi

if [ "$master" = 1 ]; then
  echo "master" >> "$log"
  : > "$sock"
  exec sleep 3600
fi

echo "exec $last" >> "$log"
exec sh -c "$last"
"#;

const SFTP: &str = r#"#!/bin/sh
echo "sftp $*" >> "__DIR__/ssh.log"
while IFS= read -r line; do
  eval "set -- $line"
  shift
  [ "$1" = "-p" ] && shift
  cp "$1" "$2" || exit 1
done
"#;

const DOCKER: &str = r#"#!/bin/sh
echo "$*" >> "__DIR__/docker.log"
cmd="$1"
shift
case "$cmd" in
  version)
    echo "24.0.7" ;;
  inspect)
    for last; do :; done
    if [ "$last" = "missing" ]; then
      echo "Error: No such object: missing" >&2
      exit 1
    fi
    echo true ;;
  exec|run)
    [ "$cmd" = run ] && shift
    workdir=""
    while [ $# -gt 0 ]; do
      case "$1" in
        -i|-t) shift ;;
        -w) workdir="$2"; shift 2 ;;
        -e) export "$2"; shift 2 ;;
        -u) shift 2 ;;
        *) break ;;
      esac
    done
    target="$1"
    shift
    if [ "$target" = "missing" ]; then
      echo "Error response from daemon: No such container: missing" >&2
      exit 1
    fi
    [ -n "$workdir" ] && cd "$workdir"
    exec "$@" ;;
  cp)
    [ "$1" = "-a" ] && shift
    case "$1" in
      missing:*)
        echo "Error response from daemon: No such container: missing" >&2
        exit 1 ;;
    esac
    cp "${1#*:}" "${2#*:}" ;;
  *)
    echo "unknown command $cmd" >&2
    exit 1 ;;
esac
"#;

const KUBECTL: &str = r#"#!/bin/sh
echo "$*" >> "__DIR__/kubectl.log"
cmd="$1"
shift
not_found() {
  echo "Error from server (NotFound): pods \"$1\" not found" >&2
  exit 1
}
case "$cmd" in
  version)
    echo "Client Version: v1.30.0" ;;
  get)
    kind="$1"
    shift
    if [ "$kind" = pods ]; then
      case "$*" in
        *"-l app=test"*)
          printf '%s' '{"items":[{"metadata":{"name":"web-1"}},{"metadata":{"name":"web-0"}}]}' ;;
        *)
          printf '%s' '{"items":[]}' ;;
      esac
      exit 0
    fi
    case "$1" in
      web-0|web-1)
        printf '%s' '{"metadata":{"name":"'"$1"'"},"status":{"conditions":[{"type":"Ready","status":"True"}]}}' ;;
      *) not_found "$1" ;;
    esac ;;
  exec)
    pod=""
    while [ $# -gt 0 ]; do
      case "$1" in
        --) shift; break ;;
        -n|-c|--context|--kubeconfig) shift 2 ;;
        -*) shift ;;
        *) pod="$1"; shift ;;
      esac
    done
    case "$pod" in
      web-0|web-1) ;;
      *) not_found "$pod" ;;
    esac
    exec "$@" ;;
  cp)
    cp "${1#*:}" "${2#*:}" ;;
  *)
    echo "unknown command $cmd" >&2
    exit 1 ;;
esac
"#;

/// Directory of stub client programs
pub struct Stubs {
    dir: TempDir,
}

impl Stubs {
    /// Write all stubs into a fresh directory
    pub fn new() -> Self {
        Self::create().expect("create stubs")
    }

    fn create() -> Result<Self> {
        let dir = tempfile::tempdir().context("create stub directory")?;
        let stubs = Self { dir };
        stubs.write("ssh", SSH)?;
        stubs.write("sftp", SFTP)?;
        stubs.write("docker", DOCKER)?;
        stubs.write("kubectl", KUBECTL)?;
        Ok(stubs)
    }

    fn write(&self, name: &str, script: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join(name);
        let script = script.replace("__DIR__", &self.dir.path().display().to_string());
        std::fs::write(&path, script).with_context(|| format!("write {} stub", name))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("make {} stub executable", name))?;
        Ok(())
    }

    /// Directory holding the stubs and their logs
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of one stub
    pub fn bin(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Binaries pointing at the stubs
    pub fn binaries(&self) -> Binaries {
        Binaries {
            ssh: self.bin("ssh"),
            sftp: self.bin("sftp"),
            docker: self.bin("docker"),
            kubectl: self.bin("kubectl"),
            ..Binaries::default()
        }
    }

    /// Engine configuration using the stubs
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            binaries: self.binaries(),
            ..EngineConfig::default()
        }
    }

    /// Lines a stub appended to `<name>.log`
    pub fn log(&self, name: &str) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join(format!("{}.log", name)))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Install a test subscriber once
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init();
}
