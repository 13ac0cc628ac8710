//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;
use tokio::sync::Notify;

use crate::process::{BackgroundProcess, CommandFuture, CommandOutput, CommandRunner};
use crate::runner::{Runner, RunnerError, RunnerFuture};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behaviour of the next background process started by [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackgroundScript {
    /// Creates the control socket named by `-S` and runs until killed.
    RunUntilKilled,
    /// Creates the control socket and exits straight away with the code.
    ExitAfterReady(Option<i32>),
    /// Exits straight away with the code without creating a socket.
    Exit(Option<i32>),
    /// Fails to start.
    FailToSpawn,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Last argument, which is the remote command for `ssh` invocations.
    #[must_use]
    pub fn last_arg(&self) -> Option<String> {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
    background: VecDeque<BackgroundScript>,
    spawned: Vec<CommandInvocation>,
    kills: Vec<Arc<AtomicUsize>>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share state, so a test can keep a handle after moving the runner
/// into the code under test.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all one-shot invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.state).invocations.clone()
    }

    /// Returns a snapshot of all background processes started so far.
    #[must_use]
    pub fn spawned(&self) -> Vec<CommandInvocation> {
        lock(&self.state).spawned.clone()
    }

    /// Total number of kill requests delivered to background processes.
    #[must_use]
    pub fn kill_requests(&self) -> usize {
        lock(&self.state)
            .kills
            .iter()
            .map(|counter| counter.load(Ordering::SeqCst))
            .sum()
    }

    /// Queues the behaviour of the next background process.
    pub fn push_background(&self, script: BackgroundScript) {
        lock(&self.state).background.push_back(script);
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes `count` successful exit statuses.
    pub fn push_successes(&self, count: usize) {
        for _ in 0..count {
            self.push_success();
        }
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.state).responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> CommandFuture<'a, CommandOutput> {
        Box::pin(async move {
            let response = {
                let mut state = lock(&self.state);
                state.invocations.push(CommandInvocation {
                    program: program.to_owned(),
                    args: args.to_vec(),
                });
                state.responses.pop_front()
            };
            response.ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
        })
    }

    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<Box<dyn BackgroundProcess>, RunnerError> {
        let mut state = lock(&self.state);
        state.spawned.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        let script = state
            .background
            .pop_front()
            .unwrap_or(BackgroundScript::RunUntilKilled);

        match script {
            BackgroundScript::FailToSpawn => {
                return Err(RunnerError::Spawn {
                    program: program.to_owned(),
                    message: String::from("scripted spawn failure"),
                });
            }
            BackgroundScript::RunUntilKilled | BackgroundScript::ExitAfterReady(_) => {
                create_control_socket(args)?;
            }
            BackgroundScript::Exit(_) => {}
        }

        let process = ScriptedProcess::new(&script);
        state.kills.push(process.kill_counter());
        Ok(Box::new(process))
    }
}

/// Creates the file named after `-S`, standing in for the socket `ssh -M`
/// would create.
fn create_control_socket(args: &[OsString]) -> Result<(), RunnerError> {
    let Some(path) = args
        .iter()
        .skip_while(|arg| arg.as_os_str() != "-S")
        .nth(1)
    else {
        return Ok(());
    };
    std::fs::write(path, b"").map_err(|err| RunnerError::Spawn {
        program: String::from("scripted master"),
        message: err.to_string(),
    })
}

/// Background process double driven by a [`BackgroundScript`].
#[derive(Debug)]
pub struct ScriptedProcess {
    exit: Option<Option<i32>>,
    killed: Arc<Notify>,
    kills: Arc<AtomicUsize>,
}

impl ScriptedProcess {
    /// Creates a process that behaves as `script` describes.
    #[must_use]
    pub fn new(script: &BackgroundScript) -> Self {
        let exit = match script {
            BackgroundScript::Exit(code) | BackgroundScript::ExitAfterReady(code) => Some(*code),
            BackgroundScript::RunUntilKilled | BackgroundScript::FailToSpawn => None,
        };
        Self {
            exit,
            killed: Arc::new(Notify::new()),
            kills: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of kill requests, shared with the process.
    #[must_use]
    pub fn kill_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.kills)
    }
}

impl BackgroundProcess for ScriptedProcess {
    fn wait(&mut self) -> CommandFuture<'_, Option<i32>> {
        Box::pin(async move {
            if let Some(code) = self.exit {
                return Ok(code);
            }
            self.killed.notified().await;
            Ok(None)
        })
    }

    fn start_kill(&mut self) -> Result<(), RunnerError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.killed.notify_one();
        Ok(())
    }
}

/// Operation observed by [`RecordingRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunnerCall {
    /// `open` was called.
    Open,
    /// `run` was called with the script.
    Run(String),
    /// `copy` was called.
    Copy {
        /// Local source path.
        local: String,
        /// Destination on the target.
        remote: String,
    },
    /// `close` was called.
    Close,
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<RunnerCall>,
    fail_open: bool,
    fail_close: bool,
    failing_copies: Vec<String>,
    failing_scripts: Vec<String>,
}

/// [`Runner`] double that records calls and fails on request.
#[derive(Clone, Debug)]
pub struct RecordingRunner {
    host: String,
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingRunner {
    /// Creates a runner for `host` that succeeds at everything.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Arc::new(Mutex::new(RecordingState::default())),
        }
    }

    /// Makes `open` fail.
    #[must_use]
    pub fn failing_open(self) -> Self {
        lock(&self.state).fail_open = true;
        self
    }

    /// Makes `close` fail.
    #[must_use]
    pub fn failing_close(self) -> Self {
        lock(&self.state).fail_close = true;
        self
    }

    /// Makes copies from `local` fail.
    #[must_use]
    pub fn failing_copy_of(self, local: impl Into<String>) -> Self {
        lock(&self.state).failing_copies.push(local.into());
        self
    }

    /// Makes scripts containing `fragment` fail.
    #[must_use]
    pub fn failing_script_containing(self, fragment: impl Into<String>) -> Self {
        lock(&self.state).failing_scripts.push(fragment.into());
        self
    }

    /// Returns a snapshot of the calls made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RunnerCall> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, call: RunnerCall) -> Result<(), RunnerError> {
        let mut state = lock(&self.state);
        let failure = match &call {
            RunnerCall::Open if state.fail_open => Some(RunnerError::ConnectionFailed {
                host: self.host.clone(),
                message: String::from("scripted open failure"),
            }),
            RunnerCall::Close if state.fail_close => Some(RunnerError::ConnectionAborted {
                host: self.host.clone(),
                reason: String::from("scripted close failure"),
            }),
            RunnerCall::Copy { local, remote } if state.failing_copies.contains(local) => {
                Some(RunnerError::TransferFailed {
                    host: self.host.clone(),
                    local: local.into(),
                    staged: remote.clone(),
                    status_text: String::from("1"),
                    stderr: String::from("scripted copy failure"),
                })
            }
            RunnerCall::Run(script)
                if state
                    .failing_scripts
                    .iter()
                    .any(|fragment| script.contains(fragment.as_str())) =>
            {
                Some(RunnerError::CommandFailed {
                    host: self.host.clone(),
                    command: script.clone(),
                    status_text: String::from("1"),
                    stderr: String::from("scripted command failure"),
                })
            }
            _ => None,
        };
        state.calls.push(call);
        failure.map_or(Ok(()), Err)
    }
}

impl Runner for RecordingRunner {
    fn host(&self) -> &str {
        &self.host
    }

    fn open(&mut self) -> RunnerFuture<'_, ()> {
        let result = self.record(RunnerCall::Open);
        Box::pin(async move { result })
    }

    fn run<'a>(&'a mut self, script: &'a str) -> RunnerFuture<'a, ()> {
        let result = self.record(RunnerCall::Run(script.to_owned()));
        Box::pin(async move { result })
    }

    fn copy<'a>(&'a mut self, local: &'a Utf8Path, remote: &'a str) -> RunnerFuture<'a, ()> {
        let result = self.record(RunnerCall::Copy {
            local: local.to_string(),
            remote: remote.to_owned(),
        });
        Box::pin(async move { result })
    }

    fn close(&mut self) -> RunnerFuture<'_, ()> {
        let result = self.record(RunnerCall::Close);
        Box::pin(async move { result })
    }
}
