//! Core library for the `testbed` deployment tool.
//!
//! The crate deploys a Nomad binary, its configuration bundles, and
//! post-install steps onto test machines. Targets come from a provisioning
//! source (a Terraform cluster description or the local Vagrant VM) and are
//! each driven through a [`runner::Runner`]: a multiplexed SSH channel for
//! remote machines, or a local runner for the current host.

pub mod config;
pub mod deploy;
pub mod logging;
pub mod process;
pub mod runner;
pub mod targets;
pub mod test_support;
pub mod util;

pub use config::{ConfigError, ProvisionConfig};
pub use deploy::{
    ArtifactSources, BinarySource, Bundle, DeployError, Deployer, Deployment, DeploymentTarget,
    InstallPlan, TargetReport,
};
pub use process::{BackgroundProcess, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use runner::{LocalRunner, Runner, RunnerError, SshEndpoint, SshOptions, SshRunner};
pub use targets::{
    BinaryOverrides, ProvisionSource, ProvisioningTargets, ResolveError, ResolvedTarget, Role,
    TargetResolver,
};
