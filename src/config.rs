//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `testbed.toml`, and `TESTBED_*` environment
//! variables. The `deploy` subcommand layers its flags on top before calling
//! [`ProvisionConfig::validate`].

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;

use crate::deploy::{ArtifactSources, DEFAULT_ARTIFACT_STORE_URL, DEFAULT_RELEASE_URL};
use crate::runner::SshOptions;
use crate::targets::{BinaryOverrides, ProvisionSource};
use crate::util::{expand_tilde, non_blank};

/// Upper bound for both timeouts, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Provisioning settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TESTBED",
    discovery(
        app_name = "testbed",
        env_var = "TESTBED_CONFIG_PATH",
        config_file_name = "testbed.toml",
        dotfile_name = ".testbed.toml",
        project_file_name = "testbed.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct ProvisionConfig {
    /// JSON file produced by `terraform output provisioning`.
    #[serde(default, deserialize_with = "optional_scalar_text")]
    pub terraform_config: Option<String>,
    /// Deploy to the local single-node Vagrant VM instead.
    #[ortho_config(default = false)]
    pub vagrant: bool,
    /// Release version forced onto every target.
    #[serde(default, deserialize_with = "optional_scalar_text")]
    pub nomad_version: Option<String>,
    /// Build sha forced onto every target.
    #[serde(default, deserialize_with = "optional_scalar_text")]
    pub nomad_sha: Option<String>,
    /// Local binary forced onto every target.
    #[serde(default, deserialize_with = "optional_scalar_text")]
    pub nomad_local_binary: Option<String>,
    /// Deploy targets concurrently, one task per target.
    #[ortho_config(default = false)]
    pub parallel: bool,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    #[serde(deserialize_with = "scalar_text")]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    #[serde(deserialize_with = "scalar_text")]
    pub scp_bin: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; defaults to disabling because
    /// test machines are recreated with fresh keys.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    #[serde(deserialize_with = "scalar_text")]
    pub ssh_known_hosts_file: String,
    /// Directory for SSH control sockets. Defaults to `~/.ssh`.
    #[serde(default, deserialize_with = "optional_scalar_text")]
    pub control_dir: Option<String>,
    /// Lifetime of each connection, in seconds.
    #[ortho_config(default = 600)]
    pub connection_timeout_secs: u64,
    /// How long to wait for a connection to come up, in seconds.
    #[ortho_config(default = 30)]
    pub ready_timeout_secs: u64,
    /// Prefix of content-addressed build archives.
    #[ortho_config(default = DEFAULT_ARTIFACT_STORE_URL.to_owned())]
    #[serde(deserialize_with = "scalar_text")]
    pub artifact_store_url: String,
    /// Base URL of release archives.
    #[ortho_config(default = DEFAULT_RELEASE_URL.to_owned())]
    #[serde(deserialize_with = "scalar_text")]
    pub release_url: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to testbed.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl ProvisionConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let mut config = Self::load_from_iter([OsString::from("testbed")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.restore_env_text(&|key| env::var(key).ok());
        Ok(config)
    }

    /// Replaces string settings with the verbatim text of their environment
    /// variables. The loader parses environment values as typed data, so
    /// `TESTBED_NOMAD_VERSION=1.10` would otherwise arrive as `1.1`.
    fn restore_env_text(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        for (key, slot) in [
            ("TESTBED_TERRAFORM_CONFIG", &mut self.terraform_config),
            ("TESTBED_NOMAD_VERSION", &mut self.nomad_version),
            ("TESTBED_NOMAD_SHA", &mut self.nomad_sha),
            ("TESTBED_NOMAD_LOCAL_BINARY", &mut self.nomad_local_binary),
            ("TESTBED_CONTROL_DIR", &mut self.control_dir),
        ] {
            if let Some(raw) = lookup(key) {
                *slot = Some(raw.trim().to_owned());
            }
        }
        for (key, slot) in [
            ("TESTBED_SSH_BIN", &mut self.ssh_bin),
            ("TESTBED_SCP_BIN", &mut self.scp_bin),
            ("TESTBED_SSH_KNOWN_HOSTS_FILE", &mut self.ssh_known_hosts_file),
            ("TESTBED_ARTIFACT_STORE_URL", &mut self.artifact_store_url),
            ("TESTBED_RELEASE_URL", &mut self.release_url),
        ] {
            if let Some(raw) = lookup(key) {
                raw.trim().clone_into(slot);
            }
        }
    }

    /// Performs semantic validation. Error messages say how to provide a
    /// missing value through the environment or `testbed.toml`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is empty
    /// and [`ConfigError::Invalid`] when values contradict each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh executable", "TESTBED_SSH_BIN", "ssh_bin"),
        )?;
        Self::require_field(
            &self.scp_bin,
            &FieldMetadata::new("scp executable", "TESTBED_SCP_BIN", "scp_bin"),
        )?;
        Self::require_field(
            &self.artifact_store_url,
            &FieldMetadata::new(
                "artifact store URL",
                "TESTBED_ARTIFACT_STORE_URL",
                "artifact_store_url",
            ),
        )?;
        Self::require_field(
            &self.release_url,
            &FieldMetadata::new("release URL", "TESTBED_RELEASE_URL", "release_url"),
        )?;
        Self::require_optional_field(
            self.control_dir.as_deref(),
            &FieldMetadata::new("control socket directory", "TESTBED_CONTROL_DIR", "control_dir"),
        )?;
        for (secs, key) in [
            (self.connection_timeout_secs, "connection_timeout_secs"),
            (self.ready_timeout_secs, "ready_timeout_secs"),
        ] {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be between 1 and {MAX_TIMEOUT_SECS} seconds, got {secs}"
                )));
            }
        }
        self.provision_source().map(|_| ())
    }

    /// Selects the provisioning source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when both sources are chosen and
    /// [`ConfigError::MissingField`] when neither is.
    pub fn provision_source(&self) -> Result<ProvisionSource, ConfigError> {
        let terraform = non_blank(self.terraform_config.as_deref());
        match (terraform, self.vagrant) {
            (Some(_), true) => Err(ConfigError::Invalid(String::from(
                "choose either a terraform target description or vagrant, not both",
            ))),
            (Some(path), false) => Ok(ProvisionSource::Terraform(Utf8PathBuf::from(
                expand_tilde(path),
            ))),
            (None, true) => Ok(ProvisionSource::Vagrant),
            (None, false) => Err(FieldMetadata::new(
                "target description (or enable vagrant)",
                "TESTBED_TERRAFORM_CONFIG",
                "terraform_config",
            )
            .missing()),
        }
    }

    /// Binary overrides applied to every target.
    #[must_use]
    pub fn overrides(&self) -> BinaryOverrides {
        BinaryOverrides {
            version: self.nomad_version.clone(),
            sha: self.nomad_sha.clone(),
            local_binary: self.nomad_local_binary.clone(),
        }
    }

    /// SSH client settings for every target.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        let defaults = SshOptions::default();
        let control_dir = non_blank(self.control_dir.as_deref())
            .map_or_else(
                || defaults.control_dir.clone(),
                |dir| Utf8PathBuf::from(expand_tilde(dir)),
            );
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            control_dir,
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            batch_mode: self.ssh_batch_mode,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            ..defaults
        }
    }

    /// Artifact locations for fetch scripts.
    #[must_use]
    pub fn artifact_sources(&self) -> ArtifactSources {
        ArtifactSources {
            store_url: self.artifact_store_url.clone(),
            release_url: self.release_url.clone(),
        }
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        Self::require_optional_field(Some(value), metadata)
    }

    fn require_optional_field(
        value: Option<&str>,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        match value {
            Some(text) if text.trim().is_empty() => Err(metadata.missing()),
            _ => Ok(()),
        }
    }
}

/// Accepts any scalar for a string setting; numbers and booleans are
/// rendered back to text. A comma-separated environment value arrives as a
/// list and is joined again.
struct ScalarText;

impl<'de> Visitor<'de> for ScalarText {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a string, number or boolean")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<String, E> {
        Ok(value.to_owned())
    }

    fn visit_string<E: de::Error>(self, value: String) -> Result<String, E> {
        Ok(value)
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> Result<String, E> {
        Ok(value.to_string())
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<String, E> {
        Ok(value.to_string())
    }

    fn visit_i128<E: de::Error>(self, value: i128) -> Result<String, E> {
        Ok(value.to_string())
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<String, E> {
        Ok(value.to_string())
    }

    fn visit_u128<E: de::Error>(self, value: u128) -> Result<String, E> {
        Ok(value.to_string())
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<String, E> {
        Ok(value.to_string())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<String, A::Error> {
        let mut parts = Vec::new();
        while let Some(part) = seq.next_element::<ScalarPart>()? {
            parts.push(part.0);
        }
        Ok(parts.join(","))
    }
}

struct ScalarPart(String);

impl<'de> Deserialize<'de> for ScalarPart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarText).map(Self)
    }
}

struct OptionalScalarText;

impl<'de> Visitor<'de> for OptionalScalarText {
    type Value = Option<String>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an optional string, number or boolean")
    }

    fn visit_none<E: de::Error>(self) -> Result<Option<String>, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Option<String>, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Option<String>, D::Error> {
        scalar_text(deserializer).map(Some)
    }
}

fn scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    deserializer.deserialize_any(ScalarText)
}

fn optional_scalar_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    deserializer.deserialize_option(OptionalScalarText)
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates values that cannot be used together or at all.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
