//! Lifetime objects backing an open multiplexed connection.
//!
//! [`ControlSocket`] owns the on-disk control socket path and removes it when
//! released or dropped. [`ChannelSupervisor`] owns the background master
//! process: it enforces the channel deadline, exposes cancellation, and
//! reports how the master ended through a single-slot completion signal.

use std::fmt;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::{BackgroundProcess, status_text};

use super::RunnerError;

/// Control socket path scoped to one target host and this process.
#[derive(Debug)]
pub struct ControlSocket {
    path: Utf8PathBuf,
    released: bool,
}

impl ControlSocket {
    /// Reserves `<control_dir>/ssh-control-<host>-<pid>.sock`, creating the
    /// directory when needed and clearing a stale socket left at that path.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::ControlSocket`] when the directory cannot be
    /// created or a stale socket cannot be removed.
    pub fn allocate(control_dir: &Utf8Path, host: &str) -> Result<Self, RunnerError> {
        let path = control_dir.join(Self::socket_name(host, std::process::id()));
        Dir::create_ambient_dir_all(control_dir, ambient_authority())
            .map_err(|err| socket_error(&path, &err))?;
        remove_socket_file(&path).map_err(|err| socket_error(&path, &err))?;
        Ok(Self {
            path,
            released: false,
        })
    }

    /// Builds the socket file name for `host` and process `pid`.
    ///
    /// Characters that are awkward in file names (for example the colons of
    /// an IPv6 address) are replaced with `_`.
    #[must_use]
    pub fn socket_name(host: &str, pid: u32) -> String {
        format!("ssh-control-{}-{pid}.sock", file_safe(host))
    }

    /// Path handed to the SSH client.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns `true` once the master connection has created the socket.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Removes the socket file. Safe to call when the file is already gone.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = remove_socket_file(&self.path) {
            warn!(path = %self.path, error = %err, "failed to remove control socket");
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Replaces characters outside `[A-Za-z0-9._-]` with `_`.
pub(crate) fn file_safe(host: &str) -> String {
    host.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn remove_socket_file(path: &Utf8Path) -> io::Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(());
    };
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    match dir.remove_file(name) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn socket_error(path: &Utf8Path, err: &io::Error) -> RunnerError {
    RunnerError::ControlSocket {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// How the background master connection ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MasterExit {
    /// The process exited on its own with the given code.
    Exited(Option<i32>),
    /// The process was stopped because the channel was cancelled.
    Cancelled,
    /// The process was stopped because the channel deadline expired.
    TimedOut,
    /// The exit status could not be collected.
    Lost(String),
}

impl MasterExit {
    /// Returns `true` for a clean exit or a cancellation we requested.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(self, Self::Exited(Some(0)) | Self::Cancelled)
    }
}

impl fmt::Display for MasterExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {}", status_text(*code)),
            Self::Cancelled => f.write_str("cancelled"),
            Self::TimedOut => f.write_str("deadline expired"),
            Self::Lost(message) => write!(f, "exit status unavailable: {message}"),
        }
    }
}

/// Supervises the background master process of an open channel.
#[derive(Debug)]
pub struct ChannelSupervisor {
    token: CancellationToken,
    completion: Option<oneshot::Receiver<MasterExit>>,
}

impl ChannelSupervisor {
    /// Starts supervising `process`, stopping it after `timeout`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(process: Box<dyn BackgroundProcess>, timeout: Duration) -> Self {
        let token = CancellationToken::new();
        let (sender, receiver) = oneshot::channel();
        tokio::spawn(supervise(process, token.clone(), timeout, sender));
        Self {
            token,
            completion: Some(receiver),
        }
    }

    /// Cancels the channel. In-flight commands are interrupted and the master
    /// process is stopped.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the channel has been cancelled, has timed out, or
    /// the master has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token observed by commands issued over the channel.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Waits for the master to finish. Does not cancel by itself; callers
    /// wanting a bounded wait call [`ChannelSupervisor::cancel`] first.
    pub async fn wait(&mut self) -> MasterExit {
        match self.completion.take() {
            Some(receiver) => receiver.await.unwrap_or_else(|_| {
                MasterExit::Lost(String::from("supervisor stopped without reporting"))
            }),
            None => MasterExit::Lost(String::from("completion already collected")),
        }
    }
}

impl Drop for ChannelSupervisor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn supervise(
    mut process: Box<dyn BackgroundProcess>,
    token: CancellationToken,
    timeout: Duration,
    sender: oneshot::Sender<MasterExit>,
) {
    let exit = tokio::select! {
        result = process.wait() => match result {
            Ok(code) => MasterExit::Exited(code),
            Err(err) => MasterExit::Lost(err.to_string()),
        },
        () = token.cancelled() => {
            stop(process.as_mut()).await;
            MasterExit::Cancelled
        }
        () = sleep(timeout) => {
            stop(process.as_mut()).await;
            MasterExit::TimedOut
        }
    };
    // Any exit, expected or not, makes the channel unusable.
    token.cancel();
    debug!(exit = %exit, "control connection finished");
    sender.send(exit).ok();
}

async fn stop(process: &mut dyn BackgroundProcess) {
    if let Err(err) = process.start_kill() {
        debug!(error = %err, "failed to signal control connection");
    }
    if let Err(err) = process.wait().await {
        debug!(error = %err, "failed to reap control connection");
    }
}
