//! Errors raised by execution channels.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced while opening, using, or closing an execution channel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when `run` or `copy` is called before a successful `open`.
    #[error("channel to {host} is not open: call open() first")]
    NotOpened {
        /// Target the channel points at.
        host: String,
    },
    /// Raised when `open` is called on a channel that is already open.
    #[error("channel to {host} is already open")]
    AlreadyOpen {
        /// Target the channel points at.
        host: String,
    },
    /// Raised when an endpoint is missing a required value.
    #[error("invalid endpoint: missing or empty {field}")]
    InvalidEndpoint {
        /// Endpoint field that failed validation.
        field: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the control socket cannot be prepared or removed.
    #[error("control socket {path}: {message}")]
    ControlSocket {
        /// Socket path on the local host.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the control connection cannot be established.
    #[error("connection to {host} failed: {message}")]
    ConnectionFailed {
        /// Target the channel points at.
        host: String,
        /// Human readable description of the failure.
        message: String,
    },
    /// Raised by `close` when the control connection ended for any reason
    /// other than success or our own cancellation.
    #[error("connection to {host} terminated abnormally: {reason}")]
    ConnectionAborted {
        /// Target the channel points at.
        host: String,
        /// How the background connection ended.
        reason: String,
    },
    /// Raised when a command is interrupted because the channel was cancelled
    /// or its deadline expired.
    #[error("channel to {host} was cancelled")]
    Cancelled {
        /// Target the channel points at.
        host: String,
    },
    /// Raised when a command exits with a non-zero status.
    #[error("command '{command}' on {host} exited with status {status_text}: {stderr}")]
    CommandFailed {
        /// Target the command ran on.
        host: String,
        /// Command line as sent to the target.
        command: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when staging a file on the target fails.
    #[error("transfer of {local} to {host}:{staged} exited with status {status_text}: {stderr}")]
    TransferFailed {
        /// Target the file was sent to.
        host: String,
        /// Local source path.
        local: Utf8PathBuf,
        /// Staging path on the target.
        staged: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the transfer client.
        stderr: String,
    },
    /// Raised when the local side of a copy cannot be inspected.
    #[error("could not read local path {path}: {message}")]
    LocalPath {
        /// Local path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a copy destination has no file name component.
    #[error("remote path {path} has no file name")]
    InvalidRemotePath {
        /// Offending destination.
        path: String,
    },
}
