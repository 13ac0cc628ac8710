//! Resolves provisioning sources into deployment targets.
//!
//! A source is either a JSON description of a cluster, as produced by
//! `terraform output provisioning`, or the fixed single-node Vagrant VM.
//! Binary overrides given on the command line are applied to every target,
//! each deployment is collapsed to a single binary source, and malformed
//! records are rejected here so the deployer only ever sees usable targets.

mod error;
mod terraform;
mod vagrant;

use camino::{Utf8Path, Utf8PathBuf};

use crate::deploy::{Deployment, DeploymentTarget};
use crate::runner::{SshEndpoint, SshOptions, SshRunner};
use crate::util::non_blank;

pub use error::ResolveError;

/// Binary source values forced onto every target.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BinaryOverrides {
    /// Release version.
    pub version: Option<String>,
    /// Build sha in the artifact store.
    pub sha: Option<String>,
    /// Local binary to upload.
    pub local_binary: Option<String>,
}

impl BinaryOverrides {
    /// Returns `true` when no override holds a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [
            self.version.as_deref(),
            self.sha.as_deref(),
            self.local_binary.as_deref(),
        ]
        .into_iter()
        .all(|value| non_blank(value).is_none())
    }

    /// Replaces the binary source fields of `deployment` when any override
    /// is set. Leaves the deployment untouched otherwise.
    pub fn apply(&self, deployment: &mut Deployment) {
        if self.is_empty() {
            return;
        }
        deployment.nomad_version = non_blank(self.version.as_deref()).map(str::to_owned);
        deployment.nomad_sha = non_blank(self.sha.as_deref()).map(str::to_owned);
        deployment.nomad_local_binary = non_blank(self.local_binary.as_deref()).map(str::to_owned);
    }
}

/// Where the target list comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionSource {
    /// JSON cluster description at the given path.
    Terraform(Utf8PathBuf),
    /// The local single-node VM.
    Vagrant,
}

impl ProvisionSource {
    fn describe(&self) -> String {
        match self {
            Self::Terraform(path) => format!("target description {path}"),
            Self::Vagrant => String::from("the vagrant source"),
        }
    }
}

/// Whether a target runs cluster servers or clients.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Cluster server.
    Server,
    /// Cluster client.
    Client,
}

/// A validated target before its runner is built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedTarget {
    /// Target name, such as `server-0`.
    pub name: String,
    /// Server or client.
    pub role: Role,
    /// Where to connect.
    pub endpoint: SshEndpoint,
    /// Deployment holding exactly one binary source.
    pub deployment: Deployment,
}

/// Servers and clients ready for deployment.
#[derive(Debug, Default)]
pub struct ProvisioningTargets {
    /// Server targets.
    pub servers: Vec<DeploymentTarget>,
    /// Client targets.
    pub clients: Vec<DeploymentTarget>,
}

impl ProvisioningTargets {
    /// Total number of targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len() + self.clients.len()
    }

    /// Returns `true` when there are no targets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Servers followed by clients.
    #[must_use]
    pub fn into_targets(self) -> Vec<DeploymentTarget> {
        self.servers.into_iter().chain(self.clients).collect()
    }
}

/// Builds deployment targets from a provisioning source.
#[derive(Clone, Debug, Default)]
pub struct TargetResolver {
    overrides: BinaryOverrides,
    ssh_options: SshOptions,
}

impl TargetResolver {
    /// Creates a resolver.
    #[must_use]
    pub const fn new(overrides: BinaryOverrides, ssh_options: SshOptions) -> Self {
        Self {
            overrides,
            ssh_options,
        }
    }

    /// Resolves and validates the targets of `source` without building
    /// runners.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] naming the offending target or file.
    pub fn describe(&self, source: &ProvisionSource) -> Result<Vec<ResolvedTarget>, ResolveError> {
        let targets = match source {
            ProvisionSource::Terraform(path) => terraform::load(path, &self.overrides)?,
            ProvisionSource::Vagrant => vec![vagrant::target(&self.overrides)?],
        };
        if targets.is_empty() {
            return Err(ResolveError::NoTargets {
                origin: source.describe(),
            });
        }
        Ok(targets)
    }

    /// Resolves `source` into targets that each own an SSH runner.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] naming the offending target or file.
    pub fn resolve(&self, source: &ProvisionSource) -> Result<ProvisioningTargets, ResolveError> {
        let mut targets = ProvisioningTargets::default();
        for resolved in self.describe(source)? {
            let runner = SshRunner::with_process_runner(resolved.endpoint, self.ssh_options.clone());
            let target = DeploymentTarget::new(resolved.name, Box::new(runner), resolved.deployment);
            match resolved.role {
                Role::Server => targets.servers.push(target),
                Role::Client => targets.clients.push(target),
            }
        }
        Ok(targets)
    }

    /// Resolves the targets described by the JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] naming the offending target or file.
    pub fn resolve_terraform(&self, path: &Utf8Path) -> Result<ProvisioningTargets, ResolveError> {
        self.resolve(&ProvisionSource::Terraform(path.to_path_buf()))
    }
}
