//! Local process builder used by every adapter
//!
//! Each transport ends up spawning a local program: the command itself, or
//! `ssh`, `docker`, `kubectl` wrapping it. This type describes that program.

use async_process::Command as AsyncCommand;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// A local program invocation
///
/// Unlike `AsyncCommand`, this type is `Clone`, comparable in tests, and can
/// be prepared multiple times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    current_dir: Option<PathBuf>,
}

impl Command {
    /// Invocation of `program` with no arguments
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    /// Append one argument
    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().into());
        self
    }

    /// Append arguments in order
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set a variable in the child's environment, on top of the inherited one
    pub fn env(&mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> &mut Self {
        self.env.insert(key.as_ref().into(), value.as_ref().into());
        self
    }

    /// Set several variables
    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self.env(key, value);
        }
        self
    }

    /// Run the child in `dir`
    pub fn current_dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.current_dir = Some(dir.as_ref().into());
        self
    }

    /// The program
    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    /// The arguments
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Variables added to the environment
    pub fn get_envs(&self) -> &BTreeMap<OsString, OsString> {
        &self.env
    }

    /// The working directory, if set
    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Program and arguments quoted as one shell line, for logs
    ///
    /// Environment values are left out since they may hold secrets.
    pub fn display(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        crate::shell::join_command(&self.program.to_string_lossy(), &args)
    }

    /// An `async_process::Command` ready to spawn
    ///
    /// The child leads its own process group, so a signal sent to the group
    /// also reaches anything a shell started. Dropping the child kills it.
    pub fn prepare(&self) -> AsyncCommand {
        use std::os::unix::process::CommandExt;

        let mut std_command = std::process::Command::new(&self.program);
        std_command
            .args(&self.args)
            .envs(&self.env)
            .process_group(0);
        if let Some(dir) = &self.current_dir {
            std_command.current_dir(dir);
        }

        let mut command = AsyncCommand::from(std_command);
        command.kill_on_drop(true);
        command
    }
}
