//! External command invocation.
//!
//! Every helper tool (FUSE drivers, extractors, fusermount) is described as a
//! [`Cmd`] and executed through a [`Runner`], so the activation and cleanup
//! logic can be exercised without the real tools installed.

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};

/// Description of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Build the `std::process::Command` equivalent.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout and stderr joined, trimmed, for diagnostics and activation logs.
    pub fn combined_output(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Executes commands to completion and captures their output.
pub trait Runner {
    /// Run `cmd` and wait for it. A non-zero exit is reported in the result,
    /// not as an error; only a failure to spawn is an `Err`.
    fn run(&self, cmd: &Cmd) -> Result<CommandResult>;
}

/// Runner backed by real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandResult> {
        tracing::debug!("running: {cmd}");
        let output = cmd
            .to_command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to execute {}", cmd.program().to_string_lossy()))?;

        Ok(CommandResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Records every command and answers with a fixed exit code.
    #[derive(Default)]
    pub(crate) struct RecordingRunner {
        pub(crate) calls: RefCell<Vec<Cmd>>,
        pub(crate) exit_code: i32,
        pub(crate) output: String,
    }

    impl RecordingRunner {
        pub(crate) fn failing(output: &str) -> Self {
            Self {
                calls: RefCell::default(),
                exit_code: 1,
                output: output.to_string(),
            }
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.calls.borrow().iter().map(ToString::to_string).collect()
        }
    }

    impl Runner for RecordingRunner {
        fn run(&self, cmd: &Cmd) -> Result<CommandResult> {
            self.calls.borrow_mut().push(cmd.clone());
            Ok(CommandResult {
                code: Some(self.exit_code),
                stdout: self.output.clone(),
                stderr: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_display() {
        let cmd = Cmd::new("squashfuse")
            .args(["-o", "ro,nodev"])
            .arg_path(Path::new("/tmp/bundle"))
            .arg("/tmp/mnt");
        assert_eq!(cmd.to_string(), "squashfuse -o ro,nodev /tmp/bundle /tmp/mnt");
    }

    #[test]
    fn test_host_runner_captures_output() {
        let result = HostRunner
            .run(&Cmd::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        assert_eq!(result.code, Some(3));
        assert!(!result.success());
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[test]
    fn test_host_runner_spawn_failure_is_error() {
        assert!(HostRunner
            .run(&Cmd::new("definitely_not_a_real_command_12345"))
            .is_err());
    }

    #[test]
    fn test_env_is_passed() {
        let result = HostRunner
            .run(&Cmd::new("sh").args(["-c", "printf %s \"$PBUNDLE_TEST\""]).env("PBUNDLE_TEST", "yes"))
            .unwrap();
        assert_eq!(result.stdout, "yes");
    }
}
