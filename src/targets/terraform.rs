//! Targets described by `terraform output provisioning`.

use camino::Utf8Path;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::deploy::Deployment;
use crate::runner::SshEndpoint;
use crate::util::{non_blank, read_to_string_ambient};

use super::{BinaryOverrides, ResolveError, ResolvedTarget, Role};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawTargets {
    #[serde(default)]
    pub(crate) servers: Vec<RawTarget>,
    #[serde(default)]
    pub(crate) clients: Vec<RawTarget>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawTarget {
    #[serde(default)]
    pub(crate) runner: RawEndpoint,
    #[serde(default)]
    pub(crate) deployment: Deployment,
}

/// Runner record as written by Terraform. Every field is optional here so
/// that a missing one is reported by name instead of as a decode failure.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawEndpoint {
    pub(crate) key: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) port: Option<Value>,
}

pub(crate) fn load(
    path: &Utf8Path,
    overrides: &BinaryOverrides,
) -> Result<Vec<ResolvedTarget>, ResolveError> {
    let document = read_to_string_ambient(path).map_err(|message| ResolveError::Read {
        path: path.to_path_buf(),
        message,
    })?;
    let raw: RawTargets =
        serde_json::from_str(&document).map_err(|err| ResolveError::Decode {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

    let servers = raw
        .servers
        .into_iter()
        .enumerate()
        .map(|(index, target)| (Role::Server, format!("server-{index}"), target));
    let clients = raw
        .clients
        .into_iter()
        .enumerate()
        .map(|(index, target)| (Role::Client, format!("client-{index}"), target));

    servers
        .chain(clients)
        .map(|(role, name, target)| {
            let (endpoint, deployment) = canonicalize(&name, target, overrides)?;
            Ok(ResolvedTarget {
                name,
                role,
                endpoint,
                deployment,
            })
        })
        .collect()
}

/// Applies overrides and validates one raw target.
///
/// The returned deployment holds exactly one binary source.
pub(crate) fn canonicalize(
    name: &str,
    raw: RawTarget,
    overrides: &BinaryOverrides,
) -> Result<(SshEndpoint, Deployment), ResolveError> {
    let mut deployment = raw.deployment;
    overrides.apply(&mut deployment);

    if deployment.remote_binary_path.trim().is_empty() {
        return Err(ResolveError::MissingInstallPath {
            target: name.to_owned(),
        });
    }

    let endpoint = resolve_endpoint(name, &raw.runner)?;

    if deployment.binary_source_count() > 1 {
        debug!(
            target_name = name,
            "several binary sources set; keeping the highest precedence one"
        );
    }
    if deployment.normalise_binary_source().is_none() {
        return Err(ResolveError::MissingBinarySource {
            target: name.to_owned(),
        });
    }
    Ok((endpoint, deployment))
}

fn resolve_endpoint(name: &str, raw: &RawEndpoint) -> Result<SshEndpoint, ResolveError> {
    let required = |value: Option<&str>, field: &'static str| {
        non_blank(value)
            .map(str::to_owned)
            .ok_or_else(|| ResolveError::MissingField {
                target: name.to_owned(),
                field,
            })
    };
    let key = required(raw.key.as_deref(), "key")?;
    let user = required(raw.user.as_deref(), "user")?;
    let host = required(raw.host.as_deref(), "host")?;
    let port = parse_port(name, raw.port.as_ref())?;
    Ok(SshEndpoint {
        key,
        user,
        host,
        port,
    })
}

/// Integral JSON numbers, including float spellings such as `22.0`.
fn port_number(value: &Value) -> Option<u16> {
    if let Some(number) = value.as_u64() {
        return u16::try_from(number).ok();
    }
    // An integral float displays without a fraction; anything else fails to parse.
    value.as_f64().and_then(|float| float.to_string().parse().ok())
}

fn parse_port(name: &str, raw: Option<&Value>) -> Result<u16, ResolveError> {
    let Some(value) = raw else {
        return Err(ResolveError::MissingField {
            target: name.to_owned(),
            field: "port",
        });
    };
    port_number(value)
        .filter(|number| *number != 0)
        .ok_or_else(|| ResolveError::InvalidPort {
            target: name.to_owned(),
            value: value.to_string(),
        })
}
