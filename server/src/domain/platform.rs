//! Per-platform provisioning knowledge: bootstrap scripts, well-known paths,
//! and service commands run inside the sandbox VM.

use roost_common::PlatformKind;

/// Path touched by the bootstrap script once platform install finished.
/// The create workflow polls for it before configuring the agent.
pub const SETUP_SENTINEL: &str = "/var/run/roost/setup-complete";

/// Where the scoped bucket credentials land inside the VM.
pub const BUCKET_CREDENTIALS_PATH: &str = "/etc/roost/bucket-credentials.json";

/// Directory for injected credential secret material inside the VM.
pub const SECRETS_DIR: &str = "/etc/roost/secrets";

/// Bootstrap script passed to the compute backend as instance user-data.
#[must_use]
pub fn setup_script(platform: PlatformKind) -> &'static str {
    match platform {
        PlatformKind::Openhands => {
            r"#!/bin/bash
set -e

apt-get update
apt-get install -y curl python3 python3-pip python3-venv

useradd -m -s /bin/bash agent || true
mkdir -p /etc/roost /etc/roost/secrets /var/run/roost
chown -R agent:agent /etc/roost

sudo -u agent python3 -m venv /home/agent/.venv
sudo -u agent /home/agent/.venv/bin/pip install openhands-ai

touch /var/run/roost/setup-complete
"
        }
        PlatformKind::Goose => {
            r"#!/bin/bash
set -e

apt-get update
apt-get install -y curl bzip2

useradd -m -s /bin/bash agent || true
mkdir -p /etc/roost /etc/roost/secrets /var/run/roost
chown -R agent:agent /etc/roost

curl -fsSL https://github.com/block/goose/releases/latest/download/download_cli.sh | sudo -u agent bash

touch /var/run/roost/setup-complete
"
        }
    }
}

/// Path of the platform's config file inside the VM. Template snapshots are
/// written here and archive reads current state from here.
#[must_use]
pub fn config_path(platform: PlatformKind) -> &'static str {
    match platform {
        PlatformKind::Openhands => "/home/agent/.openhands/settings.json",
        PlatformKind::Goose => "/home/agent/.config/goose/config.yaml",
    }
}

/// Command that starts the agent's service process, listening on `port`.
#[must_use]
pub fn start_command(platform: PlatformKind, port: u16) -> String {
    match platform {
        PlatformKind::Openhands => format!(
            "sudo -u agent sh -c 'nohup /home/agent/.venv/bin/openhands serve --port {port} >/home/agent/service.log 2>&1 &'"
        ),
        PlatformKind::Goose => format!(
            "sudo -u agent sh -c 'nohup /home/agent/.local/bin/goose web --port {port} >/home/agent/service.log 2>&1 &'"
        ),
    }
}

/// Command asking the service process to shut down cleanly.
#[must_use]
pub fn stop_command(platform: PlatformKind) -> &'static str {
    match platform {
        PlatformKind::Openhands => "sudo -u agent pkill -TERM -f 'openhands serve' || true",
        PlatformKind::Goose => "sudo -u agent pkill -TERM -f 'goose web' || true",
    }
}

/// Command probing service liveness; exit code 0 means healthy.
#[must_use]
pub fn health_command(port: u16) -> String {
    format!("curl -fsS -o /dev/null http://127.0.0.1:{port}/health")
}

/// Command checking whether the bootstrap sentinel exists yet.
#[must_use]
pub fn setup_probe_command() -> String {
    format!("test -f {SETUP_SENTINEL}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_scripts_touch_the_sentinel() {
        for platform in [PlatformKind::Openhands, PlatformKind::Goose] {
            assert!(
                setup_script(platform).contains(SETUP_SENTINEL),
                "{platform} script must signal completion"
            );
        }
    }

    #[test]
    fn start_command_carries_port() {
        assert!(start_command(PlatformKind::Openhands, 18789).contains("18789"));
        assert!(start_command(PlatformKind::Goose, 9000).contains("9000"));
    }
}
