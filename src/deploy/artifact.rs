//! Install plans for each binary source.

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;

use super::BinarySource;

/// Default prefix of content-addressed builds.
pub const DEFAULT_ARTIFACT_STORE_URL: &str = "s3://nomad-team-test-binary/builds-oss";

/// Default base URL of published releases.
pub const DEFAULT_RELEASE_URL: &str = "https://releases.hashicorp.com/nomad";

/// Where binaries are fetched from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactSources {
    /// Prefix of content-addressed build archives.
    pub store_url: String,
    /// Base URL of release archives.
    pub release_url: String,
}

impl Default for ArtifactSources {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_ARTIFACT_STORE_URL.to_owned(),
            release_url: DEFAULT_RELEASE_URL.to_owned(),
        }
    }
}

/// How the binary reaches its install path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstallPlan {
    /// Copy a local file straight to the install path.
    Upload {
        /// Local binary.
        local: Utf8PathBuf,
    },
    /// Run a script on the target that fetches and installs the binary.
    Fetch {
        /// Newline separated commands.
        script: String,
    },
}

impl ArtifactSources {
    /// Archive URL of build `sha` for `platform`.
    #[must_use]
    pub fn build_url(&self, platform: &str, sha: &str) -> String {
        format!(
            "{}/nomad_{platform}_{sha}.tar.gz",
            self.store_url.trim_end_matches('/')
        )
    }

    /// Archive URL of release `version` for `platform`.
    #[must_use]
    pub fn release_url(&self, version: &str, platform: &str) -> String {
        format!(
            "{}/{version}/nomad_{version}_{platform}.zip",
            self.release_url.trim_end_matches('/')
        )
    }

    /// Builds the install plan for `source`.
    ///
    /// Fetch scripts download the archive, unpack it into the install
    /// directory, then make the binary executable and root-owned.
    #[must_use]
    pub fn plan(&self, source: &BinarySource, remote_binary_path: &str, platform: &str) -> InstallPlan {
        match source {
            BinarySource::LocalFile(local) => InstallPlan::Upload {
                local: local.clone(),
            },
            BinarySource::ArtifactStore { sha } => {
                let url = self.build_url(platform, sha);
                let archive = "/tmp/nomad.tar.gz";
                let fetch = [
                    format!("aws s3 cp {} {archive}", escape(url.into())),
                    format!(
                        "sudo tar -zxvf {archive} -C {}",
                        escape(install_dir(remote_binary_path).into())
                    ),
                ];
                InstallPlan::Fetch {
                    script: finish_script(&fetch, remote_binary_path),
                }
            }
            BinarySource::Release { version } => {
                let url = self.release_url(version, platform);
                let archive = "/tmp/nomad.zip";
                let fetch = [
                    format!("curl -L --fail -o {archive} {}", escape(url.into())),
                    format!(
                        "sudo unzip -o {archive} -d {}",
                        escape(install_dir(remote_binary_path).into())
                    ),
                ];
                InstallPlan::Fetch {
                    script: finish_script(&fetch, remote_binary_path),
                }
            }
        }
    }
}

fn install_dir(remote_binary_path: &str) -> String {
    match Utf8Path::new(remote_binary_path).parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_string(),
        _ => String::from("."),
    }
}

fn finish_script(fetch: &[String], remote_binary_path: &str) -> String {
    let binary = escape(remote_binary_path.into());
    let mut lines = fetch.to_vec();
    lines.push(format!("sudo chmod 0755 {binary}"));
    lines.push(format!("sudo chown root:root {binary}"));
    lines.join("\n")
}
