//! Execution channel for the machine running the deployment.
//!
//! Useful for single-host test setups. Configurations deployed this way must
//! avoid port clashes with anything already listening on the host.

use std::ffi::OsString;

use camino::Utf8Path;
use tracing::{debug, info};

use crate::process::{CommandRunner, ProcessCommandRunner};

use super::{Runner, RunnerError, RunnerFuture, script_lines};

const HOST: &str = "localhost";

/// [`Runner`] that executes on the local host.
#[derive(Clone, Debug, Default)]
pub struct LocalRunner<R: CommandRunner = ProcessCommandRunner> {
    commands: R,
    opened: bool,
}

impl LocalRunner<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub const fn with_process_runner() -> Self {
        Self::new(ProcessCommandRunner)
    }
}

impl<R: CommandRunner> LocalRunner<R> {
    /// Creates an idle runner.
    #[must_use]
    pub const fn new(commands: R) -> Self {
        Self {
            commands,
            opened: false,
        }
    }

    fn require_open(&self) -> Result<(), RunnerError> {
        if self.opened {
            Ok(())
        } else {
            Err(RunnerError::NotOpened {
                host: HOST.to_owned(),
            })
        }
    }

    async fn exec(&self, program: &str, args: &[OsString]) -> Result<(), RunnerError> {
        let output = self.commands.run(program, args).await?;
        for line in output.stdout.lines().chain(output.stderr.lines()) {
            debug!(host = HOST, "{line}");
        }
        if output.is_success() {
            return Ok(());
        }
        let command = std::iter::once(program.to_owned())
            .chain(args.iter().map(|arg| arg.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ");
        Err(RunnerError::CommandFailed {
            host: HOST.to_owned(),
            command,
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }

    async fn run_script(&self, script: &str) -> Result<(), RunnerError> {
        self.require_open()?;
        for command in script_lines(script) {
            debug!(host = HOST, command, "running local command");
            let args = [OsString::from("-c"), OsString::from(command)];
            self.exec("sh", &args).await.map_err(|err| match err {
                RunnerError::CommandFailed {
                    host,
                    status_text,
                    stderr,
                    ..
                } => RunnerError::CommandFailed {
                    host,
                    command: command.to_owned(),
                    status_text,
                    stderr,
                },
                other => other,
            })?;
        }
        Ok(())
    }

    async fn copy_path(&self, local: &Utf8Path, remote: &str) -> Result<(), RunnerError> {
        self.require_open()?;
        info!(host = HOST, %local, remote, "copying");
        let is_dir = local
            .metadata()
            .map_err(|err| RunnerError::LocalPath {
                path: local.to_path_buf(),
                message: err.to_string(),
            })?
            .is_dir();

        if is_dir {
            self.exec("mkdir", &[OsString::from("-p"), OsString::from(remote)])
                .await?;
            let contents = OsString::from(format!("{local}/."));
            self.exec("cp", &[OsString::from("-Rf"), contents, OsString::from(remote)])
                .await
        } else {
            self.exec(
                "cp",
                &[
                    OsString::from("-f"),
                    OsString::from(local.as_str()),
                    OsString::from(remote),
                ],
            )
            .await
        }
    }
}

impl<R: CommandRunner> Runner for LocalRunner<R> {
    fn host(&self) -> &str {
        HOST
    }

    fn open(&mut self) -> RunnerFuture<'_, ()> {
        let result = if self.opened {
            Err(RunnerError::AlreadyOpen {
                host: HOST.to_owned(),
            })
        } else {
            self.opened = true;
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn run<'a>(&'a mut self, script: &'a str) -> RunnerFuture<'a, ()> {
        Box::pin(self.run_script(script))
    }

    fn copy<'a>(&'a mut self, local: &'a Utf8Path, remote: &'a str) -> RunnerFuture<'a, ()> {
        Box::pin(self.copy_path(local, remote))
    }

    fn close(&mut self) -> RunnerFuture<'_, ()> {
        self.opened = false;
        Box::pin(async { Ok(()) })
    }
}
