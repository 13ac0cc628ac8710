//! Errors raised while resolving provisioning targets.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced while turning a provisioning source into targets.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    /// Raised when the target description file cannot be read.
    #[error("could not read target description {path}: {message}")]
    Read {
        /// File that failed to load.
        path: Utf8PathBuf,
        /// Underlying I/O failure.
        message: String,
    },
    /// Raised when the target description is not valid JSON of the
    /// expected shape.
    #[error("could not decode target description {path}: {message}")]
    Decode {
        /// File that failed to decode.
        path: Utf8PathBuf,
        /// Decoder message.
        message: String,
    },
    /// Raised when a target has no install path for the binary.
    #[error("bad deployment for {target}: 'remote_binary_path' is missing")]
    MissingInstallPath {
        /// Target name.
        target: String,
    },
    /// Raised when a runner endpoint field is absent or blank.
    #[error("bad runner config for {target}: '{field}' is missing")]
    MissingField {
        /// Target name.
        target: String,
        /// Field name within the runner record.
        field: &'static str,
    },
    /// Raised when the runner port is not a usable TCP port.
    #[error("bad runner config for {target}: 'port' must be between 1 and 65535, got {value}")]
    InvalidPort {
        /// Target name.
        target: String,
        /// Offending value as written.
        value: String,
    },
    /// Raised when no binary source survives overrides and normalisation.
    #[error(
        "no binary source for {target}: set nomad_local_binary, nomad_sha or nomad_version, \
         or pass --nomad-local-binary, --nomad-sha or --nomad-version"
    )]
    MissingBinarySource {
        /// Target name.
        target: String,
    },
    /// Raised when the single-node VM source is used without a binary
    /// override.
    #[error(
        "the vagrant target needs one of --nomad-local-binary, --nomad-sha or --nomad-version"
    )]
    VagrantWithoutOverride,
    /// Raised when a source yields no targets at all.
    #[error("{origin} does not describe any servers or clients")]
    NoTargets {
        /// Description of the provisioning source.
        origin: String,
    },
}
