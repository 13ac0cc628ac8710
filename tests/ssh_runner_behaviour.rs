//! Deployments driven over the SSH runner with scripted client processes.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use testbed::test_support::{BackgroundScript, ScriptedRunner};
use testbed::{
    Bundle, DeployError, Deployer, Deployment, DeploymentTarget, SshEndpoint, SshOptions,
    SshRunner,
};

struct Harness {
    commands: ScriptedRunner,
    options: SshOptions,
    workspace: Utf8PathBuf,
    _tmp: TempDir,
}

impl Harness {
    fn target(&self, deployment: Deployment) -> DeploymentTarget {
        let endpoint = SshEndpoint::new("~/.ssh/cluster.pem", "ubuntu", "10.0.0.5", 22)
            .expect("endpoint should validate");
        let runner = SshRunner::new(endpoint, self.options.clone(), self.commands.clone());
        DeploymentTarget::new("server-0", Box::new(runner), deployment)
    }

    fn control_dir_is_empty(&self) -> bool {
        std::fs::read_dir(&self.options.control_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    /// Remote commands sent over the control socket, in order.
    fn remote_commands(&self) -> Vec<String> {
        self.commands
            .invocations()
            .iter()
            .filter(|invocation| invocation.program == "ssh")
            .filter_map(testbed::test_support::CommandInvocation::last_arg)
            .collect()
    }
}

#[fixture]
fn harness() -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 temp path");
    let workspace = root.join("workspace");
    std::fs::create_dir_all(workspace.join("bin")).expect("create bundle dir");
    std::fs::write(workspace.join("nomad"), "binary").expect("write binary");
    std::fs::write(workspace.join("bin/config.hcl"), "server = true").expect("write config");
    let options = SshOptions {
        control_dir: root.join("sockets"),
        ready_timeout: Duration::from_secs(2),
        ready_poll_interval: Duration::from_millis(5),
        ..SshOptions::default()
    };
    Harness {
        commands: ScriptedRunner::new(),
        options,
        workspace,
        _tmp: tmp,
    }
}

#[rstest]
#[tokio::test]
async fn release_deployment_runs_fetch_script_over_one_connection(harness: Harness) {
    let deployment = Deployment {
        nomad_version: Some(String::from("1.2.3")),
        remote_binary_path: String::from("/usr/local/bin/nomad"),
        platform: String::from("linux_amd64"),
        steps: vec![String::from("sudo systemctl restart nomad")],
        ..Deployment::default()
    };
    harness.commands.push_successes(5);

    Deployer::default()
        .deploy_target(&mut harness.target(deployment))
        .await
        .expect("deployment should succeed");

    assert_eq!(harness.commands.spawned().len(), 1);
    let commands = harness.remote_commands();
    assert_eq!(commands.len(), 5, "commands: {commands:?}");
    assert!(commands.first().is_some_and(|command| command.starts_with("curl -L --fail")));
    assert_eq!(
        commands.last().map(String::as_str),
        Some("sudo systemctl restart nomad")
    );
    assert_eq!(harness.commands.kill_requests(), 1);
    assert!(harness.control_dir_is_empty());
}

#[rstest]
#[tokio::test]
async fn local_binary_and_bundles_are_staged_then_moved(harness: Harness) {
    let deployment = Deployment {
        nomad_local_binary: Some(harness.workspace.join("nomad").to_string()),
        remote_binary_path: String::from("/usr/local/bin/nomad"),
        platform: String::from("linux_amd64"),
        bundles: vec![Bundle::new(
            harness.workspace.join("bin").as_str(),
            "/home/ubuntu/bin",
        )],
        ..Deployment::default()
    };
    // staging dir; binary: scp + mv; bundle: scp + mkdir + cp + rm; cleanup
    harness.commands.push_successes(8);

    Deployer::default()
        .deploy_target(&mut harness.target(deployment))
        .await
        .expect("deployment should succeed");

    let programs: Vec<String> = harness
        .commands
        .invocations()
        .iter()
        .map(|invocation| invocation.program.clone())
        .collect();
    assert_eq!(
        programs,
        vec!["ssh", "scp", "ssh", "scp", "ssh", "ssh", "ssh", "ssh"]
    );
    let staging = format!("/tmp/testbed-10.0.0.5-{}", std::process::id());
    assert_eq!(
        harness.remote_commands(),
        vec![
            format!("rm -rf {staging} && mkdir -m 0700 {staging}"),
            format!("sudo mv {staging}/nomad /usr/local/bin/nomad"),
            String::from("sudo mkdir -p /home/ubuntu/bin"),
            format!("sudo cp -R {staging}/bin/. /home/ubuntu/bin"),
            format!("sudo rm -r {staging}/bin"),
            format!("rm -rf {staging}"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn failing_fetch_cancels_the_channel_and_still_closes(harness: Harness) {
    let deployment = Deployment {
        nomad_sha: Some(String::from("abc123")),
        remote_binary_path: String::from("/usr/local/bin/nomad"),
        platform: String::from("linux_amd64"),
        ..Deployment::default()
    };
    harness.commands.push_failure(1);

    let err = Deployer::default()
        .deploy_target(&mut harness.target(deployment))
        .await
        .expect_err("failed fetch should abort");

    assert!(matches!(err, DeployError::Install { .. }), "got {err:?}");
    assert_eq!(harness.remote_commands().len(), 1);
    assert!(harness.control_dir_is_empty());
}

#[rstest]
#[tokio::test]
async fn master_that_never_connects_fails_open(harness: Harness) {
    harness.commands.push_background(BackgroundScript::Exit(Some(255)));
    let deployment = Deployment {
        nomad_version: Some(String::from("1.2.3")),
        remote_binary_path: String::from("/usr/local/bin/nomad"),
        platform: String::from("linux_amd64"),
        ..Deployment::default()
    };

    let err = Deployer::default()
        .deploy_target(&mut harness.target(deployment))
        .await
        .expect_err("open should fail");

    assert!(matches!(err, DeployError::Open { .. }), "got {err:?}");
    assert!(harness.commands.invocations().is_empty());
    assert!(harness.control_dir_is_empty());
}
