//! Fixed single-node target for the local Vagrant VM.

use crate::deploy::{Bundle, Deployment};
use crate::runner::SshEndpoint;

use super::{BinaryOverrides, ResolveError, ResolvedTarget, Role};

const KEY: &str = "../.vagrant/machines/linux-ui/virtualbox/private_key";
const USER: &str = "vagrant";
const HOST: &str = "127.0.0.1";
const PORT: u16 = 2222;
const REMOTE_BINARY_PATH: &str = "/opt/gopath/bin/nomad";
const PLATFORM: &str = "linux_amd64";

pub(crate) fn target(overrides: &BinaryOverrides) -> Result<ResolvedTarget, ResolveError> {
    if overrides.is_empty() {
        return Err(ResolveError::VagrantWithoutOverride);
    }
    let mut deployment = Deployment {
        remote_binary_path: REMOTE_BINARY_PATH.to_owned(),
        platform: PLATFORM.to_owned(),
        bundles: vec![
            Bundle::new("../bin", "/home/vagrant/bin"),
            Bundle::new("../bin/config.hcl", "/home/vagrant/config.hcl"),
        ],
        steps: vec![
            String::from("sudo systemctl restart consul"),
            String::from("sudo systemctl restart nomad"),
        ],
        ..Deployment::default()
    };
    overrides.apply(&mut deployment);
    deployment.normalise_binary_source();

    Ok(ResolvedTarget {
        name: String::from("vagrant"),
        role: Role::Server,
        endpoint: SshEndpoint {
            key: KEY.to_owned(),
            user: USER.to_owned(),
            host: HOST.to_owned(),
            port: PORT,
        },
        deployment,
    })
}
