//! Process execution seam shared by the runners.
//!
//! Runners never spawn processes directly: one-shot commands and the
//! long-lived multiplexing master both go through [`CommandRunner`], which
//! keeps the SSH and local runners testable with scripted fakes.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::runner::RunnerError;

/// Future returned by process operations.
pub type CommandFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RunnerError>> + Send + 'a>>;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status, `unknown` when the process was killed by a
    /// signal.
    #[must_use]
    pub fn status_text(&self) -> String {
        status_text(self.code)
    }
}

/// Renders an optional exit code for error messages.
#[must_use]
pub fn status_text(code: Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |value| value.to_string())
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// Dropping the returned future terminates the child process.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString])
    -> CommandFuture<'a, CommandOutput>;

    /// Starts `program` in the background and returns a handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started.
    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<Box<dyn BackgroundProcess>, RunnerError>;
}

/// Handle to a process started with [`CommandRunner::spawn`].
pub trait BackgroundProcess: Send {
    /// Waits for the process to exit and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] when the status cannot be collected.
    fn wait(&mut self) -> CommandFuture<'_, Option<i32>>;

    /// Requests termination without waiting for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] when the signal cannot be delivered.
    fn start_kill(&mut self) -> Result<(), RunnerError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> CommandFuture<'a, CommandOutput> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| spawn_error(program, &err))?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<Box<dyn BackgroundProcess>, RunnerError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| spawn_error(program, &err))?;

        Ok(Box::new(ChildProcess {
            program: program.to_owned(),
            child,
        }))
    }
}

struct ChildProcess {
    program: String,
    child: Child,
}

impl BackgroundProcess for ChildProcess {
    fn wait(&mut self) -> CommandFuture<'_, Option<i32>> {
        Box::pin(async move {
            let status = self
                .child
                .wait()
                .await
                .map_err(|err| spawn_error(&self.program, &err))?;
            Ok(status.code())
        })
    }

    fn start_kill(&mut self) -> Result<(), RunnerError> {
        self.child
            .start_kill()
            .map_err(|err| spawn_error(&self.program, &err))
    }
}

fn spawn_error(program: &str, err: &std::io::Error) -> RunnerError {
    RunnerError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}
