//! Execution channels used to deploy onto a single target.
//!
//! A [`Runner`] owns one channel to one target and exposes the four
//! operations the deployer needs: open the channel, run a script, copy a path,
//! and close the channel again. Operations take `&mut self`, so a channel is
//! only ever driven by one caller at a time.

use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;

mod control;
mod error;
mod local;
mod ssh;

pub use control::{ChannelSupervisor, ControlSocket, MasterExit};
pub use error::RunnerError;
pub use local::LocalRunner;
pub use ssh::{
    DEFAULT_CONNECTION_TIMEOUT, DEFAULT_READY_TIMEOUT, SshEndpoint, SshOptions, SshRunner,
    STAGING_DIR,
};

/// Future returned by runner operations.
pub type RunnerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RunnerError>> + Send + 'a>>;

/// Capability interface over a remote or local execution target.
pub trait Runner: Send {
    /// Identity of the target, used to give errors and logs context.
    fn host(&self) -> &str;

    /// Establishes the channel. Must be called once before `run` or `copy`.
    fn open(&mut self) -> RunnerFuture<'_, ()>;

    /// Runs each line of `script` in order, stopping at the first failure.
    fn run<'a>(&'a mut self, script: &'a str) -> RunnerFuture<'a, ()>;

    /// Copies a local file or directory to `remote` on the target.
    fn copy<'a>(&'a mut self, local: &'a Utf8Path, remote: &'a str) -> RunnerFuture<'a, ()>;

    /// Tears the channel down and releases its resources. Calling `close` on a
    /// channel that was never opened is a no-op.
    fn close(&mut self) -> RunnerFuture<'_, ()>;
}

/// Splits a script into trimmed command lines, skipping blank ones.
pub fn script_lines(script: &str) -> impl Iterator<Item = &str> {
    script
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
}
