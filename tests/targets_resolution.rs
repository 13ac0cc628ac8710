//! Resolution of Terraform target descriptions read from disk.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use testbed::{BinaryOverrides, ProvisionSource, ResolveError, Role, SshOptions, TargetResolver};

const CLUSTER: &str = r#"{
    "servers": [
        {
            "runner": {"key": "keys/a.pem", "user": "ubuntu", "host": "10.0.0.10", "port": 22},
            "deployment": {
                "nomad_sha": "abc123",
                "remote_binary_path": "/usr/local/bin/nomad",
                "platform": "linux_amd64",
                "steps": ["sudo systemctl restart nomad"]
            }
        }
    ],
    "clients": [
        {
            "runner": {"key": "keys/a.pem", "user": "ubuntu", "host": "10.0.0.20", "port": 22},
            "deployment": {"nomad_version": "1.2.3", "remote_binary_path": "/usr/local/bin/nomad", "platform": "linux_amd64"}
        },
        {
            "runner": {"key": "keys/a.pem", "user": "ubuntu", "host": "10.0.0.21", "port": 2222},
            "deployment": {"nomad_version": "1.2.3", "remote_binary_path": "/usr/local/bin/nomad", "platform": "linux_amd64"}
        }
    ]
}"#;

struct Description {
    path: Utf8PathBuf,
    _tmp: TempDir,
}

fn description(contents: &str) -> Description {
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("provisioning.json"))
        .expect("utf8 temp path");
    std::fs::write(&path, contents).expect("write description");
    Description { path, _tmp: tmp }
}

#[fixture]
fn resolver() -> TargetResolver {
    TargetResolver::default()
}

#[rstest]
fn cluster_targets_are_named_by_role(resolver: TargetResolver) {
    let file = description(CLUSTER);

    let targets = resolver
        .describe(&ProvisionSource::Terraform(file.path.clone()))
        .expect("cluster should resolve");

    let summary: Vec<(&str, Role, &str, u16)> = targets
        .iter()
        .map(|target| {
            (
                target.name.as_str(),
                target.role,
                target.endpoint.host.as_str(),
                target.endpoint.port,
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            ("server-0", Role::Server, "10.0.0.10", 22),
            ("client-0", Role::Client, "10.0.0.20", 22),
            ("client-1", Role::Client, "10.0.0.21", 2222),
        ]
    );
}

#[rstest]
fn resolved_targets_own_runners_for_their_hosts(resolver: TargetResolver) {
    let file = description(CLUSTER);

    let targets = resolver
        .resolve_terraform(&file.path)
        .expect("cluster should resolve");

    assert_eq!(targets.servers.len(), 1);
    assert_eq!(targets.clients.len(), 2);
    let hosts: Vec<String> = targets
        .into_targets()
        .iter()
        .map(|target| target.host().to_owned())
        .collect();
    assert_eq!(hosts, vec!["10.0.0.10", "10.0.0.20", "10.0.0.21"]);
}

#[rstest]
fn local_binary_override_applies_to_every_target() {
    let file = description(CLUSTER);
    let overrides = BinaryOverrides {
        local_binary: Some(String::from("./pkg/nomad")),
        ..BinaryOverrides::default()
    };
    let resolver = TargetResolver::new(overrides, SshOptions::default());

    let targets = resolver
        .describe(&ProvisionSource::Terraform(file.path.clone()))
        .expect("cluster should resolve");

    for target in &targets {
        assert_eq!(target.deployment.binary_source_count(), 1);
        assert_eq!(
            target.deployment.nomad_local_binary.as_deref(),
            Some("./pkg/nomad")
        );
    }
}

#[rstest]
fn missing_file_is_a_read_error(resolver: TargetResolver) {
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("absent.json")).expect("utf8 path");

    let err = resolver
        .describe(&ProvisionSource::Terraform(path))
        .expect_err("missing file should fail");

    assert!(matches!(err, ResolveError::Read { .. }), "got {err:?}");
}

#[rstest]
#[case::not_json("servers:")]
#[case::wrong_shape(r#"{"servers": {"runner": {}}}"#)]
fn malformed_file_is_a_decode_error(resolver: TargetResolver, #[case] contents: &str) {
    let file = description(contents);

    let err = resolver
        .describe(&ProvisionSource::Terraform(file.path.clone()))
        .expect_err("malformed file should fail");

    assert!(matches!(err, ResolveError::Decode { .. }), "got {err:?}");
}

#[rstest]
fn empty_cluster_is_rejected(resolver: TargetResolver) {
    let file = description(r#"{"servers": [], "clients": []}"#);

    let err = resolver
        .describe(&ProvisionSource::Terraform(file.path.clone()))
        .expect_err("empty cluster should fail");

    assert!(matches!(err, ResolveError::NoTargets { .. }), "got {err:?}");
}

#[rstest]
fn bad_client_is_named(resolver: TargetResolver) {
    let file = description(
        r#"{"clients": [
            {"runner": {"key": "k", "user": "u", "host": "h", "port": 22},
             "deployment": {"nomad_version": "1.2.3", "remote_binary_path": "/bin/nomad"}},
            {"runner": {"key": "k", "user": "u", "port": 22},
             "deployment": {"nomad_version": "1.2.3", "remote_binary_path": "/bin/nomad"}}
        ]}"#,
    );

    let err = resolver
        .describe(&ProvisionSource::Terraform(file.path.clone()))
        .expect_err("client without host should fail");

    assert_eq!(
        err.to_string(),
        "bad runner config for client-1: 'host' is missing"
    );
}
