//! Drives deployments onto targets through the [`Runner`] contract.
//!
//! Each target goes through the same sequence: open the channel, install the
//! binary, copy bundles in declared order, run post-install steps in declared
//! order, and close the channel. The channel is closed on every exit path,
//! including a failed open. Nothing is rolled back when a phase fails, so a
//! target may be left partially updated.

mod artifact;
mod descriptor;
mod error;

use std::fmt;

use camino::Utf8Path;
use tracing::{error, info, warn};

use crate::runner::Runner;

pub use artifact::{ArtifactSources, DEFAULT_ARTIFACT_STORE_URL, DEFAULT_RELEASE_URL, InstallPlan};
pub use descriptor::{BinarySource, Bundle, Deployment};
pub use error::DeployError;

/// A destination paired with its execution channel and deployment.
///
/// The target owns its runner exclusively for its whole lifetime.
pub struct DeploymentTarget {
    /// Name of the target within its provisioning source.
    pub name: String,
    /// Channel used to reach the target.
    pub runner: Box<dyn Runner>,
    /// What to deploy.
    pub deployment: Deployment,
}

impl DeploymentTarget {
    /// Creates a target.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: Box<dyn Runner>, deployment: Deployment) -> Self {
        Self {
            name: name.into(),
            runner,
            deployment,
        }
    }

    /// Host the target's runner connects to.
    #[must_use]
    pub fn host(&self) -> &str {
        self.runner.host()
    }
}

impl fmt::Debug for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentTarget")
            .field("name", &self.name)
            .field("host", &self.runner.host())
            .field("deployment", &self.deployment)
            .finish()
    }
}

/// Outcome of deploying one target.
#[derive(Debug)]
pub struct TargetReport {
    /// Target name.
    pub name: String,
    /// Target host.
    pub host: String,
    /// Result of the deployment.
    pub result: Result<(), DeployError>,
}

impl TargetReport {
    /// Returns `true` when the deployment succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Deploys targets using the configured artifact locations.
#[derive(Clone, Debug, Default)]
pub struct Deployer {
    artifacts: ArtifactSources,
}

impl Deployer {
    /// Creates a deployer.
    #[must_use]
    pub const fn new(artifacts: ArtifactSources) -> Self {
        Self { artifacts }
    }

    /// Artifact locations used for fetch scripts.
    #[must_use]
    pub const fn artifacts(&self) -> &ArtifactSources {
        &self.artifacts
    }

    /// Deploys a single target.
    ///
    /// # Errors
    ///
    /// Returns a [`DeployError`] naming the host and the phase that failed.
    pub async fn deploy_target(&self, target: &mut DeploymentTarget) -> Result<(), DeployError> {
        self.deploy(target.runner.as_mut(), &target.deployment).await
    }

    /// Deploys `deployment` through `runner`.
    ///
    /// The descriptor is validated before the channel is opened. Once `open`
    /// has been attempted, `close` is always attempted too.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Config`] when the descriptor is unusable, a
    /// phase error when a runner operation fails, and
    /// [`DeployError::CloseAfterFailure`] when closing also fails after an
    /// earlier error.
    pub async fn deploy(
        &self,
        runner: &mut dyn Runner,
        deployment: &Deployment,
    ) -> Result<(), DeployError> {
        let host = runner.host().to_owned();
        let binary = validate(&host, deployment)?;

        info!(host = %host, "opening connection");
        let outcome = match runner.open().await {
            Ok(()) => self.provision(runner, &host, deployment, &binary).await,
            Err(source) => Err(DeployError::Open {
                host: host.clone(),
                source,
            }),
        };

        info!(host = %host, "closing connection");
        let closed = runner.close().await;
        match (outcome, closed) {
            (Ok(()), Ok(())) => {
                info!(host = %host, "deployment complete");
                Ok(())
            }
            (Ok(()), Err(source)) => Err(DeployError::Close { host, source }),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(close)) => {
                warn!(host = %host, error = %close, "closing connection failed after an earlier error");
                Err(DeployError::CloseAfterFailure {
                    primary: Box::new(primary),
                    close,
                })
            }
        }
    }

    /// Deploys each target in turn. A failing target does not stop the rest.
    pub async fn deploy_all(&self, targets: &mut [DeploymentTarget]) -> Vec<TargetReport> {
        let mut reports = Vec::with_capacity(targets.len());
        for target in targets.iter_mut() {
            let result = self.deploy_target(target).await;
            if let Err(err) = &result {
                error!(name = %target.name, error = %err, "deployment failed");
            }
            reports.push(TargetReport {
                name: target.name.clone(),
                host: target.host().to_owned(),
                result,
            });
        }
        reports
    }

    /// Deploys every target on its own task.
    ///
    /// Reports come back in the order the targets were given.
    pub async fn deploy_all_concurrently(
        &self,
        targets: Vec<DeploymentTarget>,
    ) -> Vec<TargetReport> {
        let tasks: Vec<_> = targets
            .into_iter()
            .map(|mut target| {
                let deployer = self.clone();
                let name = target.name.clone();
                let host = target.host().to_owned();
                let handle =
                    tokio::spawn(async move { deployer.deploy_target(&mut target).await });
                (name, host, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(tasks.len());
        for (name, host, handle) in tasks {
            let result = handle.await.unwrap_or_else(|err| {
                Err(DeployError::Aborted {
                    host: host.clone(),
                    message: err.to_string(),
                })
            });
            if let Err(err) = &result {
                error!(name = %name, error = %err, "deployment failed");
            }
            reports.push(TargetReport { name, host, result });
        }
        reports
    }

    async fn provision(
        &self,
        runner: &mut dyn Runner,
        host: &str,
        deployment: &Deployment,
        binary: &BinarySource,
    ) -> Result<(), DeployError> {
        self.install(runner, host, deployment, binary).await?;

        for bundle in &deployment.bundles {
            info!(host, source = %bundle.source, destination = %bundle.destination, "copying bundle");
            runner
                .copy(Utf8Path::new(&bundle.source), &bundle.destination)
                .await
                .map_err(|source| DeployError::Bundle {
                    host: host.to_owned(),
                    bundle: bundle.source.clone(),
                    source,
                })?;
        }

        for step in &deployment.steps {
            info!(host, step = step.as_str(), "running deployment step");
            runner
                .run(step)
                .await
                .map_err(|source| DeployError::Step {
                    host: host.to_owned(),
                    step: step.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn install(
        &self,
        runner: &mut dyn Runner,
        host: &str,
        deployment: &Deployment,
        binary: &BinarySource,
    ) -> Result<(), DeployError> {
        let remote = deployment.remote_binary_path.as_str();
        info!(host, method = binary.method(), remote, "installing binary");
        let plan = self.artifacts.plan(binary, remote, &deployment.platform);
        let result = match &plan {
            InstallPlan::Upload { local } => runner.copy(local, remote).await,
            InstallPlan::Fetch { script } => runner.run(script).await,
        };
        result.map_err(|source| DeployError::Install {
            host: host.to_owned(),
            method: binary.method(),
            source,
        })
    }
}

fn validate(host: &str, deployment: &Deployment) -> Result<BinarySource, DeployError> {
    let config_error = |message: &str| DeployError::Config {
        host: host.to_owned(),
        message: message.to_owned(),
    };
    if deployment.remote_binary_path.trim().is_empty() {
        return Err(config_error("remote_binary_path must not be empty"));
    }
    let binary = deployment.binary_source().ok_or_else(|| {
        config_error("no binary source set; provide nomad_local_binary, nomad_sha or nomad_version")
    })?;
    if !matches!(binary, BinarySource::LocalFile(_)) && deployment.platform.trim().is_empty() {
        return Err(config_error("platform is required to fetch a binary"));
    }
    Ok(binary)
}

#[cfg(test)]
mod tests;
