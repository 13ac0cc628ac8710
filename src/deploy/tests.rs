//! Unit tests for deployment sequencing.

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{RecordingRunner, RunnerCall};

fn copy(local: &str, remote: &str) -> RunnerCall {
    RunnerCall::Copy {
        local: local.to_owned(),
        remote: remote.to_owned(),
    }
}

fn target(runner: &RecordingRunner, deployment: Deployment) -> DeploymentTarget {
    DeploymentTarget::new("server-0", Box::new(runner.clone()), deployment)
}

#[fixture]
fn deployment() -> Deployment {
    Deployment {
        remote_binary_path: String::from("/opt/bin/nomad"),
        platform: String::from("linux_amd64"),
        ..Deployment::default()
    }
}

#[fixture]
fn deployer() -> Deployer {
    Deployer::default()
}

#[rstest]
#[case::local_only(Some("./nomad"), None, None, Some(BinarySource::LocalFile("./nomad".into())))]
#[case::local_beats_sha(
    Some("./nomad"),
    Some("abc123"),
    Some("1.2.3"),
    Some(BinarySource::LocalFile("./nomad".into()))
)]
#[case::sha_beats_version(
    None,
    Some("abc123"),
    Some("1.2.3"),
    Some(BinarySource::ArtifactStore { sha: "abc123".into() })
)]
#[case::version_only(None, None, Some("1.2.3"), Some(BinarySource::Release { version: "1.2.3".into() }))]
#[case::blank_is_unset(Some("  "), Some(""), Some("1.2.3"), Some(BinarySource::Release { version: "1.2.3".into() }))]
#[case::none(None, None, None, None)]
fn binary_source_follows_precedence(
    mut deployment: Deployment,
    #[case] local: Option<&str>,
    #[case] sha: Option<&str>,
    #[case] version: Option<&str>,
    #[case] expected: Option<BinarySource>,
) {
    deployment.nomad_local_binary = local.map(str::to_owned);
    deployment.nomad_sha = sha.map(str::to_owned);
    deployment.nomad_version = version.map(str::to_owned);
    assert_eq!(deployment.binary_source(), expected);
}

#[rstest]
fn normalise_keeps_only_the_winning_source(mut deployment: Deployment) {
    deployment.nomad_sha = Some(String::from("abc123"));
    deployment.nomad_version = Some(String::from("1.2.3"));
    assert_eq!(deployment.binary_source_count(), 2);

    let source = deployment.normalise_binary_source();

    assert_eq!(
        source,
        Some(BinarySource::ArtifactStore {
            sha: String::from("abc123")
        })
    );
    assert_eq!(deployment.binary_source_count(), 1);
    assert_eq!(deployment.nomad_version, None);
}

#[rstest]
fn store_fetch_script_unpacks_and_permissions_binary() {
    let sources = ArtifactSources {
        store_url: String::from("s3://bucket/builds/"),
        ..ArtifactSources::default()
    };
    let plan = sources.plan(
        &BinarySource::ArtifactStore {
            sha: String::from("abc123"),
        },
        "/opt/bin/nomad",
        "linux_amd64",
    );
    let InstallPlan::Fetch { script } = plan else {
        panic!("expected a fetch plan, got {plan:?}");
    };
    let lines: Vec<&str> = script.lines().collect();
    assert_eq!(
        lines,
        vec![
            "aws s3 cp 's3://bucket/builds/nomad_linux_amd64_abc123.tar.gz' /tmp/nomad.tar.gz",
            "sudo tar -zxvf /tmp/nomad.tar.gz -C /opt/bin",
            "sudo chmod 0755 /opt/bin/nomad",
            "sudo chown root:root /opt/bin/nomad",
        ]
    );
}

#[rstest]
fn release_url_uses_version_and_platform() {
    let sources = ArtifactSources::default();
    assert_eq!(
        sources.release_url("1.2.3", "linux_amd64"),
        "https://releases.hashicorp.com/nomad/1.2.3/nomad_1.2.3_linux_amd64.zip"
    );
}

#[rstest]
#[tokio::test]
async fn local_binary_is_copied_directly(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_local_binary = Some(String::from("./nomad"));
    let runner = RecordingRunner::new("10.0.0.5");

    deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect("deployment should succeed");

    assert_eq!(
        runner.calls(),
        vec![
            RunnerCall::Open,
            copy("./nomad", "/opt/bin/nomad"),
            RunnerCall::Close
        ]
    );
}

#[rstest]
#[tokio::test]
async fn release_is_fetched_with_one_script(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_version = Some(String::from("1.2.3"));
    let runner = RecordingRunner::new("10.0.0.5");

    deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect("deployment should succeed");

    let calls = runner.calls();
    assert_eq!(calls.len(), 3, "calls: {calls:?}");
    let RunnerCall::Run(script) = &calls[1] else {
        panic!("expected a script, got {:?}", calls[1]);
    };
    assert!(script.contains("1.2.3"));
    assert!(script.contains("linux_amd64"));
    assert!(script.contains("sudo unzip -o /tmp/nomad.zip -d /opt/bin"));
    assert!(script.contains("sudo chmod 0755 /opt/bin/nomad"));
    assert!(script.contains("sudo chown root:root /opt/bin/nomad"));
}

#[rstest]
#[tokio::test]
async fn failed_bundle_stops_deployment_but_closes(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_local_binary = Some(String::from("./nomad"));
    deployment.bundles = vec![
        Bundle::new("../bin", "/home/vagrant/bin"),
        Bundle::new("../bin/config.hcl", "/home/vagrant/config.hcl"),
    ];
    deployment.steps = vec![String::from("sudo systemctl restart nomad")];
    let runner = RecordingRunner::new("10.0.0.5").failing_copy_of("../bin");

    let err = deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect_err("bundle failure should abort");

    let DeployError::Bundle { bundle, host, .. } = &err else {
        panic!("expected a bundle error, got {err:?}");
    };
    assert_eq!(bundle, "../bin");
    assert_eq!(host, "10.0.0.5");
    assert!(err.to_string().contains("copying bundle '../bin'"));
    assert_eq!(
        runner.calls(),
        vec![
            RunnerCall::Open,
            copy("./nomad", "/opt/bin/nomad"),
            copy("../bin", "/home/vagrant/bin"),
            RunnerCall::Close
        ]
    );
}

#[rstest]
#[tokio::test]
async fn local_binary_wins_over_sha(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_local_binary = Some(String::from("./nomad"));
    deployment.nomad_sha = Some(String::from("abc123"));
    let runner = RecordingRunner::new("10.0.0.5");

    deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect("deployment should succeed");

    let calls = runner.calls();
    assert!(calls.contains(&copy("./nomad", "/opt/bin/nomad")));
    assert!(
        !calls.iter().any(|call| matches!(call, RunnerCall::Run(_))),
        "no fetch script expected: {calls:?}"
    );
}

#[rstest]
#[case::missing_install_path(Some("1.2.3"), "", "linux_amd64", "remote_binary_path")]
#[case::missing_source(None, "/opt/bin/nomad", "linux_amd64", "no binary source")]
#[case::missing_platform(Some("1.2.3"), "/opt/bin/nomad", " ", "platform")]
#[tokio::test]
async fn invalid_descriptor_is_rejected_before_open(
    deployer: Deployer,
    #[case] version: Option<&str>,
    #[case] remote_binary_path: &str,
    #[case] platform: &str,
    #[case] fragment: &str,
) {
    let deployment = Deployment {
        nomad_version: version.map(str::to_owned),
        remote_binary_path: remote_binary_path.to_owned(),
        platform: platform.to_owned(),
        ..Deployment::default()
    };
    let runner = RecordingRunner::new("10.0.0.5");

    let err = deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect_err("invalid descriptor should fail");

    assert!(matches!(err, DeployError::Config { .. }), "got {err:?}");
    assert!(err.to_string().contains(fragment), "got {err}");
    assert!(runner.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_open_still_closes(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_version = Some(String::from("1.2.3"));
    let runner = RecordingRunner::new("10.0.0.5").failing_open();

    let err = deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect_err("open failure should abort");

    assert!(matches!(err, DeployError::Open { .. }), "got {err:?}");
    assert_eq!(runner.calls(), vec![RunnerCall::Open, RunnerCall::Close]);
}

#[rstest]
#[tokio::test]
async fn failed_step_skips_later_steps(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_local_binary = Some(String::from("./nomad"));
    deployment.steps = vec![
        String::from("sudo systemctl restart consul"),
        String::from("sudo systemctl restart nomad"),
    ];
    let runner = RecordingRunner::new("10.0.0.5").failing_script_containing("consul");

    let err = deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect_err("step failure should abort");

    let DeployError::Step { step, .. } = &err else {
        panic!("expected a step error, got {err:?}");
    };
    assert_eq!(step, "sudo systemctl restart consul");
    let calls = runner.calls();
    assert!(!calls.contains(&RunnerCall::Run(String::from(
        "sudo systemctl restart nomad"
    ))));
    assert_eq!(calls.last(), Some(&RunnerCall::Close));
}

#[rstest]
#[tokio::test]
async fn close_failure_after_success_is_reported(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_local_binary = Some(String::from("./nomad"));
    let runner = RecordingRunner::new("10.0.0.5").failing_close();

    let err = deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect_err("close failure should surface");

    assert!(matches!(err, DeployError::Close { .. }), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn close_failure_is_noted_on_earlier_error(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_local_binary = Some(String::from("./nomad"));
    let runner = RecordingRunner::new("10.0.0.5")
        .failing_copy_of("./nomad")
        .failing_close();

    let err = deployer
        .deploy_target(&mut target(&runner, deployment))
        .await
        .expect_err("install failure should abort");

    let DeployError::CloseAfterFailure { primary, .. } = &err else {
        panic!("expected a combined error, got {err:?}");
    };
    assert!(matches!(**primary, DeployError::Install { .. }));
    assert_eq!(err.host(), "10.0.0.5");
    let message = err.to_string();
    assert!(message.contains("local binary upload"), "got {message}");
    assert!(message.contains("closing the connection also failed"), "got {message}");
}

#[rstest]
#[tokio::test]
async fn one_failing_target_does_not_stop_the_rest(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_local_binary = Some(String::from("./nomad"));
    let broken = RecordingRunner::new("10.0.0.5").failing_open();
    let healthy = RecordingRunner::new("10.0.0.6");
    let mut targets = vec![
        DeploymentTarget::new("server-0", Box::new(broken.clone()), deployment.clone()),
        DeploymentTarget::new("server-1", Box::new(healthy.clone()), deployment),
    ];

    let reports = deployer.deploy_all(&mut targets).await;

    assert_eq!(reports.len(), 2);
    assert!(!reports[0].is_success());
    assert!(reports[1].is_success());
    assert_eq!(reports[1].host, "10.0.0.6");
    assert_eq!(healthy.calls().len(), 3);
}

#[rstest]
#[tokio::test]
async fn concurrent_reports_keep_target_order(deployer: Deployer, mut deployment: Deployment) {
    deployment.nomad_local_binary = Some(String::from("./nomad"));
    let targets = (0..4)
        .map(|index| {
            let runner = if index == 2 {
                RecordingRunner::new(format!("10.0.0.{index}")).failing_open()
            } else {
                RecordingRunner::new(format!("10.0.0.{index}"))
            };
            DeploymentTarget::new(format!("client-{index}"), Box::new(runner), deployment.clone())
        })
        .collect();

    let reports = deployer.deploy_all_concurrently(targets).await;

    let names: Vec<&str> = reports.iter().map(|report| report.name.as_str()).collect();
    assert_eq!(names, vec!["client-0", "client-1", "client-2", "client-3"]);
    let outcomes: Vec<bool> = reports.iter().map(|report| report.is_success()).collect();
    assert_eq!(outcomes, vec![true, true, false, true]);
}
