//! Command-line interface definitions for the `testbed` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{ArgAction, Parser};

/// Top-level CLI for the `testbed` binary.
#[derive(Debug, Parser)]
#[command(
    name = "testbed",
    about = "Deploy a Nomad binary and its configuration onto test machines",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Install the binary, copy bundles, and run post-install steps on every
    /// target.
    #[command(
        name = "deploy",
        about = "Install the binary, copy bundles, and run post-install steps on every target"
    )]
    Deploy(DeployCommand),
}

/// Arguments for the `testbed deploy` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DeployCommand {
    /// JSON target description produced by `terraform output provisioning`.
    #[arg(long, value_name = "FILE", conflicts_with = "vagrant")]
    pub(crate) terraform: Option<String>,
    /// Deploy to the local single-node Vagrant VM.
    ///
    /// Requires one of the `--nomad-*` flags.
    #[arg(long)]
    pub(crate) vagrant: bool,
    /// Release version to install on every target.
    #[arg(long, value_name = "VERSION")]
    pub(crate) nomad_version: Option<String>,
    /// Build sha to fetch from the artifact store for every target.
    #[arg(long, value_name = "SHA")]
    pub(crate) nomad_sha: Option<String>,
    /// Local binary to upload to every target. Wins over the sha and the
    /// version.
    #[arg(long, value_name = "PATH")]
    pub(crate) nomad_local_binary: Option<String>,
    /// Deploy to all targets at once instead of one after another.
    #[arg(long)]
    pub(crate) parallel: bool,
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = ArgAction::Count)]
    pub(crate) verbose: u8,
}
