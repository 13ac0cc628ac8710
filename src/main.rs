//! Binary entry point for the `testbed` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;

use testbed::{
    ConfigError, Deployer, ProvisionConfig, ResolveError, TargetReport, TargetResolver, logging,
};

mod cli;

use cli::{Cli, DeployCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("target resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("{failed} of {total} targets failed to deploy")]
    DeployFailed { failed: usize, total: usize },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Deploy(command) => deploy(command).await,
    }
}

async fn deploy(command: DeployCommand) -> Result<(), CliError> {
    logging::init(command.verbose);

    let mut config = ProvisionConfig::load_without_cli_args()?;
    apply_flags(&mut config, &command);
    config.validate()?;

    let resolver = TargetResolver::new(config.overrides(), config.ssh_options());
    let mut targets = resolver.resolve(&config.provision_source()?)?.into_targets();
    let deployer = Deployer::new(config.artifact_sources());
    let reports = if config.parallel {
        deployer.deploy_all_concurrently(targets).await
    } else {
        deployer.deploy_all(&mut targets).await
    };

    write_summary(io::stderr(), &reports);
    let failed = reports.iter().filter(|report| !report.is_success()).count();
    if failed == 0 {
        Ok(())
    } else {
        Err(CliError::DeployFailed {
            failed,
            total: reports.len(),
        })
    }
}

/// Layers command-line flags over the loaded configuration.
fn apply_flags(config: &mut ProvisionConfig, command: &DeployCommand) {
    if let Some(path) = &command.terraform {
        config.terraform_config = Some(path.clone());
        config.vagrant = false;
    }
    if command.vagrant {
        config.vagrant = true;
        config.terraform_config = None;
    }
    if let Some(version) = &command.nomad_version {
        config.nomad_version = Some(version.clone());
    }
    if let Some(sha) = &command.nomad_sha {
        config.nomad_sha = Some(sha.clone());
    }
    if let Some(path) = &command.nomad_local_binary {
        config.nomad_local_binary = Some(path.clone());
    }
    if command.parallel {
        config.parallel = true;
    }
}

fn write_summary(mut target: impl Write, reports: &[TargetReport]) {
    for report in reports {
        let written = match &report.result {
            Ok(()) => writeln!(target, "ok      {} ({})", report.name, report.host),
            Err(err) => writeln!(target, "failed  {} ({}): {err}", report.name, report.host),
        };
        written.ok();
    }
}

fn report_error(err: &CliError) {
    writeln!(io::stderr(), "{err}").ok();
}
