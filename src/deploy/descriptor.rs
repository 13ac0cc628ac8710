//! Deployment descriptors and binary source selection.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::util::non_blank;

/// A local path copied onto the target as-is.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct Bundle {
    /// Local file or directory.
    pub source: String,
    /// Destination on the target.
    pub destination: String,
}

impl Bundle {
    /// Creates a bundle.
    #[must_use]
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// How to materialise the binary on a target, plus what to do afterwards.
///
/// Only one binary source is used. When several are set the local binary
/// wins over the build sha, which wins over the release version, so a locally
/// built binary always overrides a named build during iterative testing.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct Deployment {
    /// Local binary to upload.
    pub nomad_local_binary: Option<String>,
    /// Content hash of a build in the artifact store.
    pub nomad_sha: Option<String>,
    /// Published release version.
    pub nomad_version: Option<String>,
    /// Install path of the binary on the target.
    pub remote_binary_path: String,
    /// Platform identifier such as `linux_amd64`.
    pub platform: String,
    /// Paths copied after the binary, in order.
    pub bundles: Vec<Bundle>,
    /// Shell steps run after the bundles, in order.
    pub steps: Vec<String>,
}

/// The binary source selected for a deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BinarySource {
    /// Upload a local file.
    LocalFile(Utf8PathBuf),
    /// Fetch a build from the artifact store by content hash.
    ArtifactStore {
        /// Build sha.
        sha: String,
    },
    /// Download a published release.
    Release {
        /// Release version.
        version: String,
    },
}

impl BinarySource {
    /// Short description of the install method, used in error messages.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::LocalFile(_) => "local binary upload",
            Self::ArtifactStore { .. } => "artifact store fetch",
            Self::Release { .. } => "release download",
        }
    }
}

impl Deployment {
    /// Selects the binary source by precedence: local binary, then build sha,
    /// then release version. Blank values count as unset.
    #[must_use]
    pub fn binary_source(&self) -> Option<BinarySource> {
        if let Some(path) = non_blank(self.nomad_local_binary.as_deref()) {
            return Some(BinarySource::LocalFile(Utf8PathBuf::from(path)));
        }
        if let Some(sha) = non_blank(self.nomad_sha.as_deref()) {
            return Some(BinarySource::ArtifactStore {
                sha: sha.to_owned(),
            });
        }
        non_blank(self.nomad_version.as_deref()).map(|version| BinarySource::Release {
            version: version.to_owned(),
        })
    }

    /// Collapses the binary source fields so only the selected one remains.
    ///
    /// Returns the surviving source, or `None` when no field was set.
    pub fn normalise_binary_source(&mut self) -> Option<BinarySource> {
        let source = self.binary_source();
        self.nomad_local_binary = None;
        self.nomad_sha = None;
        self.nomad_version = None;
        match &source {
            Some(BinarySource::LocalFile(path)) => {
                self.nomad_local_binary = Some(path.to_string());
            }
            Some(BinarySource::ArtifactStore { sha }) => self.nomad_sha = Some(sha.clone()),
            Some(BinarySource::Release { version }) => {
                self.nomad_version = Some(version.clone());
            }
            None => {}
        }
        source
    }

    /// Number of binary source fields holding a value.
    #[must_use]
    pub fn binary_source_count(&self) -> usize {
        [
            self.nomad_local_binary.as_deref(),
            self.nomad_sha.as_deref(),
            self.nomad_version.as_deref(),
        ]
        .into_iter()
        .filter(|value| non_blank(*value).is_some())
        .count()
    }
}
