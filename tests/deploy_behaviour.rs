//! End-to-end deployments onto the local host.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use testbed::{Bundle, DeployError, Deployer, Deployment, DeploymentTarget, LocalRunner};

struct Site {
    root: Utf8PathBuf,
    _tmp: TempDir,
}

impl Site {
    fn path(&self, relative: &str) -> Utf8PathBuf {
        self.root.join(relative)
    }

    fn write(&self, relative: &str, contents: &str) -> Utf8PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&path, contents).expect("write file");
        path
    }

    fn deployment(&self) -> Deployment {
        std::fs::create_dir_all(self.path("opt/bin")).expect("create install dir");
        Deployment {
            nomad_local_binary: Some(self.write("build/nomad", "binary").to_string()),
            remote_binary_path: self.path("opt/bin/nomad").to_string(),
            platform: String::from("linux_amd64"),
            ..Deployment::default()
        }
    }
}

#[fixture]
fn site() -> Site {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 temp path");
    Site { root, _tmp: tmp }
}

fn local_target(deployment: Deployment) -> DeploymentTarget {
    DeploymentTarget::new(
        "local",
        Box::new(LocalRunner::with_process_runner()),
        deployment,
    )
}

#[rstest]
#[tokio::test]
async fn full_deployment_installs_bundles_and_runs_steps(site: Site) {
    site.write("bundle/config.hcl", "server = true");
    let mut deployment = site.deployment();
    deployment.bundles = vec![Bundle::new(
        site.path("bundle").as_str(),
        site.path("etc/nomad.d").as_str(),
    )];
    deployment.steps = vec![format!("touch {}", site.path("restarted"))];

    Deployer::default()
        .deploy_target(&mut local_target(deployment))
        .await
        .expect("deployment should succeed");

    assert_eq!(
        std::fs::read_to_string(site.path("opt/bin/nomad")).expect("installed binary"),
        "binary"
    );
    assert_eq!(
        std::fs::read_to_string(site.path("etc/nomad.d/config.hcl")).expect("bundle file"),
        "server = true"
    );
    assert!(site.path("restarted").exists());
}

#[rstest]
#[tokio::test]
async fn failing_step_stops_later_steps(site: Site) {
    let mut deployment = site.deployment();
    deployment.steps = vec![
        String::from("false"),
        format!("touch {}", site.path("never")),
    ];

    let err = Deployer::default()
        .deploy_target(&mut local_target(deployment))
        .await
        .expect_err("failing step should abort");

    assert!(matches!(err, DeployError::Step { ref step, .. } if step == "false"), "got {err:?}");
    assert!(!site.path("never").exists());
}

#[rstest]
#[tokio::test]
async fn missing_bundle_is_named(site: Site) {
    let mut deployment = site.deployment();
    let missing = site.path("no-such-bundle");
    deployment.bundles = vec![Bundle::new(missing.as_str(), site.path("etc").as_str())];

    let err = Deployer::default()
        .deploy_target(&mut local_target(deployment))
        .await
        .expect_err("missing bundle should abort");

    assert!(err.to_string().contains("no-such-bundle"), "got {err}");
}

#[rstest]
#[tokio::test]
async fn parallel_and_sequential_runs_agree(site: Site) {
    let deployment = site.deployment();
    let deployer = Deployer::default();

    let mut sequential = vec![local_target(deployment.clone())];
    let sequential_reports = deployer.deploy_all(&mut sequential).await;
    let parallel_reports = deployer
        .deploy_all_concurrently(vec![local_target(deployment)])
        .await;

    assert!(sequential_reports.iter().all(testbed::TargetReport::is_success));
    assert!(parallel_reports.iter().all(testbed::TargetReport::is_success));
}
