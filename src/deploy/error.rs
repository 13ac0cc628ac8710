//! Errors raised while deploying onto a target.

use thiserror::Error;

use crate::runner::RunnerError;

/// Errors surfaced by the deployer, each naming the host and phase.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeployError {
    /// Raised when the descriptor cannot be deployed as written. Detected
    /// before anything touches the target.
    #[error("invalid deployment for {host}: {message}")]
    Config {
        /// Target host.
        host: String,
        /// Human-readable description of the problem.
        message: String,
    },
    /// Raised when the channel cannot be opened.
    #[error("opening connection to {host} failed: {source}")]
    Open {
        /// Target host.
        host: String,
        /// Underlying runner error.
        #[source]
        source: RunnerError,
    },
    /// Raised when installing the binary fails.
    #[error("installing binary on {host} failed ({method}): {source}")]
    Install {
        /// Target host.
        host: String,
        /// Which binary source was being installed.
        method: &'static str,
        /// Underlying runner error.
        #[source]
        source: RunnerError,
    },
    /// Raised when copying a bundle fails.
    #[error("copying bundle '{bundle}' to {host} failed: {source}")]
    Bundle {
        /// Target host.
        host: String,
        /// Local source of the failing bundle.
        bundle: String,
        /// Underlying runner error.
        #[source]
        source: RunnerError,
    },
    /// Raised when a post-install step fails.
    #[error("deployment step {step:?} on {host} failed: {source}")]
    Step {
        /// Target host.
        host: String,
        /// Step text as declared.
        step: String,
        /// Underlying runner error.
        #[source]
        source: RunnerError,
    },
    /// Raised when closing the channel fails after a successful deployment.
    #[error("closing connection to {host} failed: {source}")]
    Close {
        /// Target host.
        host: String,
        /// Underlying runner error.
        #[source]
        source: RunnerError,
    },
    /// Raised when closing the channel fails after an earlier failure.
    #[error("{primary} (closing the connection also failed: {close})")]
    CloseAfterFailure {
        /// The failure that ended the deployment.
        #[source]
        primary: Box<DeployError>,
        /// The close failure.
        close: RunnerError,
    },
    /// Raised when a concurrent deployment task dies without reporting.
    #[error("deployment task for {host} aborted: {message}")]
    Aborted {
        /// Target host.
        host: String,
        /// Join error text.
        message: String,
    },
}

impl DeployError {
    /// Host the error refers to.
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Config { host, .. }
            | Self::Open { host, .. }
            | Self::Install { host, .. }
            | Self::Bundle { host, .. }
            | Self::Step { host, .. }
            | Self::Close { host, .. }
            | Self::Aborted { host, .. } => host,
            Self::CloseAfterFailure { primary, .. } => primary.host(),
        }
    }
}
