//! Multiplexed SSH execution channel.
//!
//! `open` starts a master connection (`ssh -M -N -S <socket>`) in the
//! background and waits for its control socket to appear. Every later `run`
//! and `copy` reuses that connection through the socket instead of paying
//! for a fresh handshake per command. Copies are staged in a directory under
//! [`STAGING_DIR`] owned by the channel and then moved into place with `sudo`,
//! so root-owned destinations work without logging in as root. The staging
//! directory is named after the host and this process, created on the first
//! copy and removed by `close`.

use std::ffi::OsString;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::process::{CommandOutput, CommandRunner, ProcessCommandRunner};
use crate::util::expand_tilde;

use super::control::file_safe;
use super::{
    ChannelSupervisor, ControlSocket, Runner, RunnerError, RunnerFuture, script_lines,
};

/// Default lifetime of an open channel.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Default bound on waiting for the master connection to come up.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// World-writable directory on the target holding per-channel staging
/// directories.
pub const STAGING_DIR: &str = "/tmp";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where and as whom to connect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshEndpoint {
    /// Private key used for authentication. Supports `~/` expansion.
    pub key: String,
    /// Account to log in as.
    pub user: String,
    /// Host name or address of the target.
    pub host: String,
    /// SSH port.
    pub port: u16,
}

impl SshEndpoint {
    /// Builds an endpoint, trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::InvalidEndpoint`] when any field is empty or the
    /// port is zero.
    pub fn new(
        key: impl Into<String>,
        user: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self, RunnerError> {
        let endpoint = Self {
            key: key.into().trim().to_owned(),
            user: user.into().trim().to_owned(),
            host: host.into().trim().to_owned(),
            port,
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Checks every field is populated.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::InvalidEndpoint`] naming the first bad field.
    pub fn validate(&self) -> Result<(), RunnerError> {
        for (value, field) in [
            (self.key.as_str(), "key"),
            (self.user.as_str(), "user"),
            (self.host.as_str(), "host"),
        ] {
            if value.trim().is_empty() {
                return Err(RunnerError::InvalidEndpoint {
                    field: field.to_owned(),
                });
            }
        }
        if self.port == 0 {
            return Err(RunnerError::InvalidEndpoint {
                field: String::from("port"),
            });
        }
        Ok(())
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Client binaries and connection policy shared by every SSH channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Directory holding control sockets.
    pub control_dir: Utf8PathBuf,
    /// Lifetime of an open channel; the master is stopped when it expires.
    pub connection_timeout: Duration,
    /// Bound on waiting for the control socket during `open`.
    pub ready_timeout: Duration,
    /// Interval between control socket checks during `open`.
    pub ready_poll_interval: Duration,
    /// Whether to force batch mode so SSH never prompts.
    pub batch_mode: bool,
    /// Whether to verify host keys. Off by default because test machines
    /// are ephemeral and their keys are never known in advance.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; empty leaves the client default.
    pub known_hosts_file: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            control_dir: Utf8PathBuf::from(expand_tilde("~/.ssh")),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            ready_poll_interval: READY_POLL_INTERVAL,
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
        }
    }
}

#[derive(Debug)]
struct OpenChannel {
    socket: ControlSocket,
    supervisor: ChannelSupervisor,
    staging_dir: String,
    staging_created: bool,
}

/// [`Runner`] that drives a target over a multiplexed SSH connection.
#[derive(Debug)]
pub struct SshRunner<R: CommandRunner = ProcessCommandRunner> {
    endpoint: SshEndpoint,
    options: SshOptions,
    commands: R,
    channel: Option<OpenChannel>,
}

impl SshRunner<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub const fn with_process_runner(endpoint: SshEndpoint, options: SshOptions) -> Self {
        Self::new(endpoint, options, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshRunner<R> {
    /// Creates an idle runner; nothing is spawned until `open`.
    #[must_use]
    pub const fn new(endpoint: SshEndpoint, options: SshOptions, commands: R) -> Self {
        Self {
            endpoint,
            options,
            commands,
            channel: None,
        }
    }

    /// Endpoint this runner connects to.
    #[must_use]
    pub const fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    /// Returns `true` while a channel is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    async fn open_channel(&mut self) -> Result<(), RunnerError> {
        if self.channel.is_some() {
            return Err(RunnerError::AlreadyOpen {
                host: self.endpoint.host.clone(),
            });
        }
        info!(host = %self.endpoint.host, port = self.endpoint.port, "opening connection");

        let socket = ControlSocket::allocate(&self.options.control_dir, &self.endpoint.host)?;
        let args = self.master_args(socket.path());
        let process = self.commands.spawn(&self.options.ssh_bin, &args)?;
        let mut supervisor = ChannelSupervisor::start(process, self.options.connection_timeout);

        if let Err(err) = self.wait_until_ready(&socket, &mut supervisor).await {
            supervisor.cancel();
            supervisor.wait().await;
            socket.release();
            return Err(err);
        }

        debug!(host = %self.endpoint.host, socket = %socket.path(), "connection established");
        self.channel = Some(OpenChannel {
            socket,
            supervisor,
            staging_dir: staging_dir(&self.endpoint.host, std::process::id()),
            staging_created: false,
        });
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        socket: &ControlSocket,
        supervisor: &mut ChannelSupervisor,
    ) -> Result<(), RunnerError> {
        // A timeout too large to represent never expires.
        let deadline = Instant::now().checked_add(self.options.ready_timeout);
        loop {
            if socket.exists() {
                return Ok(());
            }
            if supervisor.is_stopped() {
                supervisor.cancel();
                let exit = supervisor.wait().await;
                return Err(RunnerError::ConnectionFailed {
                    host: self.endpoint.host.clone(),
                    message: format!("control connection {exit} before it was established"),
                });
            }
            if deadline.is_some_and(|limit| Instant::now() >= limit) {
                return Err(RunnerError::ConnectionFailed {
                    host: self.endpoint.host.clone(),
                    message: format!(
                        "control socket did not appear within {} seconds",
                        self.options.ready_timeout.as_secs()
                    ),
                });
            }
            sleep(self.options.ready_poll_interval).await;
        }
    }

    async fn run_script(&mut self, script: &str) -> Result<(), RunnerError> {
        self.require_open()?;
        for command in script_lines(script) {
            self.run_command(command).await?;
        }
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<(), RunnerError> {
        let channel = self.require_open()?;
        debug!(host = %self.endpoint.host, command, "running remote command");
        let args = self.command_args(channel.socket.path(), command);
        let output = self.exec(channel, &self.options.ssh_bin, &args).await?;
        self.relay(&output);

        if output.is_success() {
            return Ok(());
        }
        channel.supervisor.cancel();
        Err(RunnerError::CommandFailed {
            host: self.endpoint.host.clone(),
            command: command.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }

    async fn copy_path(&mut self, local: &Utf8Path, remote: &str) -> Result<(), RunnerError> {
        let staged = staging_path(&self.require_open()?.staging_dir, remote)?;
        info!(host = %self.endpoint.host, %local, remote, "copying");

        let is_dir = local
            .metadata()
            .map_err(|err| RunnerError::LocalPath {
                path: local.to_path_buf(),
                message: err.to_string(),
            })?
            .is_dir();

        self.ensure_staging_dir().await?;
        self.transfer(local, &staged).await?;
        for command in relocation_commands(&staged, remote, is_dir) {
            self.run_command(&command).await?;
        }
        Ok(())
    }

    async fn transfer(&self, local: &Utf8Path, staged: &str) -> Result<(), RunnerError> {
        let channel = self.require_open()?;
        let args = self.transfer_args(channel.socket.path(), local, staged);
        let output = self.exec(channel, &self.options.scp_bin, &args).await?;
        if output.is_success() {
            return Ok(());
        }
        self.relay(&output);
        channel.supervisor.cancel();
        Err(RunnerError::TransferFailed {
            host: self.endpoint.host.clone(),
            local: local.to_path_buf(),
            staged: staged.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }

    /// Creates the channel's staging directory once, replacing anything left
    /// at that path by an earlier process.
    async fn ensure_staging_dir(&mut self) -> Result<(), RunnerError> {
        let channel = self.require_open()?;
        if channel.staging_created {
            return Ok(());
        }
        let dir = escape(channel.staging_dir.as_str().into());
        let command = format!("rm -rf {dir} && mkdir -m 0700 {dir}");
        self.run_command(&command).await?;
        if let Some(open) = self.channel.as_mut() {
            open.staging_created = true;
        }
        Ok(())
    }

    /// Best-effort removal of the staging directory before the master stops.
    async fn remove_staging_dir(&self, channel: &OpenChannel) {
        let command = format!("rm -rf {}", escape(channel.staging_dir.as_str().into()));
        let args = self.command_args(channel.socket.path(), &command);
        match self.exec(channel, &self.options.ssh_bin, &args).await {
            Ok(output) if output.is_success() => {}
            Ok(output) => warn!(
                host = %self.endpoint.host,
                dir = %channel.staging_dir,
                status = %output.status_text(),
                "failed to remove staging directory"
            ),
            Err(err) => warn!(
                host = %self.endpoint.host,
                dir = %channel.staging_dir,
                error = %err,
                "failed to remove staging directory"
            ),
        }
    }

    async fn close_channel(&mut self) -> Result<(), RunnerError> {
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };
        info!(host = %self.endpoint.host, "closing connection");

        if channel.staging_created && !channel.supervisor.is_stopped() {
            self.remove_staging_dir(&channel).await;
        }
        let OpenChannel {
            socket,
            mut supervisor,
            ..
        } = channel;
        supervisor.cancel();
        let exit = supervisor.wait().await;
        socket.release();

        if exit.is_expected() {
            Ok(())
        } else {
            Err(RunnerError::ConnectionAborted {
                host: self.endpoint.host.clone(),
                reason: exit.to_string(),
            })
        }
    }

    /// Runs one command over the channel, abandoning it when the channel is
    /// cancelled. A spawn failure also cancels the channel.
    async fn exec(
        &self,
        channel: &OpenChannel,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, RunnerError> {
        let result = tokio::select! {
            biased;
            () = channel.supervisor.token().cancelled() => Err(RunnerError::Cancelled {
                host: self.endpoint.host.clone(),
            }),
            output = self.commands.run(program, args) => output,
        };
        if result.is_err() {
            channel.supervisor.cancel();
        }
        result
    }

    fn require_open(&self) -> Result<&OpenChannel, RunnerError> {
        self.channel.as_ref().ok_or_else(|| RunnerError::NotOpened {
            host: self.endpoint.host.clone(),
        })
    }

    fn relay(&self, output: &CommandOutput) {
        let host = self.endpoint.host.as_str();
        for line in output.stdout.lines() {
            debug!(host, stream = "stdout", "{line}");
        }
        for line in output.stderr.lines() {
            debug!(host, stream = "stderr", "{line}");
        }
    }

    fn master_args(&self, socket: &Utf8Path) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-M"),
            OsString::from("-N"),
            OsString::from("-S"),
            OsString::from(socket.as_str()),
        ];
        args.extend(self.common_options("-p"));
        args.push(OsString::from(self.endpoint.destination()));
        args
    }

    fn command_args(&self, socket: &Utf8Path, command: &str) -> Vec<OsString> {
        let mut args = vec![OsString::from("-S"), OsString::from(socket.as_str())];
        args.extend(self.common_options("-p"));
        args.push(OsString::from(self.endpoint.destination()));
        args.push(OsString::from(command));
        args
    }

    fn transfer_args(&self, socket: &Utf8Path, local: &Utf8Path, staged: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-r"),
            OsString::from("-o"),
            OsString::from(format!("ControlPath={socket}")),
        ];
        args.extend(self.common_options("-P"));
        args.push(OsString::from(local.as_str()));
        args.push(OsString::from(format!(
            "{}:{staged}",
            self.endpoint.destination()
        )));
        args
    }

    /// Options shared by `ssh` and `scp`; the clients spell the port flag
    /// differently, so the caller passes it in.
    fn common_options(&self, port_flag: &str) -> Vec<OsString> {
        let mut args = Vec::new();

        if self.options.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.options.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.options.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.options.known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from("LogLevel=ERROR"));
        args.push(OsString::from("-i"));
        args.push(OsString::from(expand_tilde(&self.endpoint.key)));
        args.push(OsString::from(port_flag));
        args.push(OsString::from(self.endpoint.port.to_string()));
        args
    }
}

impl<R: CommandRunner> Runner for SshRunner<R> {
    fn host(&self) -> &str {
        &self.endpoint.host
    }

    fn open(&mut self) -> RunnerFuture<'_, ()> {
        Box::pin(self.open_channel())
    }

    fn run<'a>(&'a mut self, script: &'a str) -> RunnerFuture<'a, ()> {
        Box::pin(self.run_script(script))
    }

    fn copy<'a>(&'a mut self, local: &'a Utf8Path, remote: &'a str) -> RunnerFuture<'a, ()> {
        Box::pin(self.copy_path(local, remote))
    }

    fn close(&mut self) -> RunnerFuture<'_, ()> {
        Box::pin(self.close_channel())
    }
}

/// Staging directory for a channel to `host` opened by process `pid`.
fn staging_dir(host: &str, pid: u32) -> String {
    format!("{STAGING_DIR}/testbed-{}-{pid}", file_safe(host))
}

/// Staging location inside `dir` for a copy destined for `remote`.
fn staging_path(dir: &str, remote: &str) -> Result<String, RunnerError> {
    let name = Utf8Path::new(remote)
        .file_name()
        .ok_or_else(|| RunnerError::InvalidRemotePath {
            path: remote.to_owned(),
        })?;
    Ok(format!("{dir}/{name}"))
}

/// Privileged commands that move a staged copy into its destination.
///
/// A file is renamed into place. A directory is merged into the destination
/// (created if missing) and the staged tree removed afterwards; a failure
/// part way through leaves the destination partially updated.
fn relocation_commands(staged: &str, remote: &str, is_dir: bool) -> Vec<String> {
    let staged_arg = escape(staged.into());
    let remote_arg = escape(remote.into());
    if !is_dir {
        return vec![format!("sudo mv {staged_arg} {remote_arg}")];
    }
    let staged_contents = escape(format!("{staged}/.").into());
    vec![
        format!("sudo mkdir -p {remote_arg}"),
        format!("sudo cp -R {staged_contents} {remote_arg}"),
        format!("sudo rm -r {staged_arg}"),
    ]
}
