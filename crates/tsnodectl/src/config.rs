//! CLI configuration (`config.json` in the installation directory)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tsnode_provision::{Ec2Settings, Poller};
use tsnode_remote::SshSettings;

use crate::error::{CliError, CliResult};

/// Tunables for talking to the provider and to launched hosts.
///
/// Every field has a default, so a partial (or absent) file is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Login user on the launched image
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Delay between readiness polls, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Timeout of a single provider call, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_ssh_connect_timeout")]
    pub ssh_connect_timeout_secs: u64,

    /// Upper bound on one remote setup command, in seconds
    #[serde(default = "default_remote_command_timeout")]
    pub remote_command_timeout_secs: u64,

    /// Region queried for the region catalogue
    #[serde(default = "default_catalog_region")]
    pub catalog_region: String,

    #[serde(default = "default_image_name_filter")]
    pub image_name_filter: String,

    #[serde(default = "default_image_owner")]
    pub image_owner: String,

    /// Provider endpoint override (e.g. a local EC2-compatible API)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_poll_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    10
}

fn default_ssh_connect_timeout() -> u64 {
    10
}

fn default_remote_command_timeout() -> u64 {
    600
}

fn default_catalog_region() -> String {
    "eu-central-1".to_string()
}

fn default_image_name_filter() -> String {
    "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*".to_string()
}

fn default_image_owner() -> String {
    "099720109477".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout(),
            remote_command_timeout_secs: default_remote_command_timeout(),
            catalog_region: default_catalog_region(),
            image_name_filter: default_image_name_filter(),
            image_owner: default_image_owner(),
            endpoint: None,
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> CliResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| CliError::Config(format!("parse {}: {e}", path.display())))
    }

    /// The file at `path`, or defaults when there is none.
    pub fn load_or_default(path: &Path) -> CliResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn ec2_settings(&self) -> Ec2Settings {
        Ec2Settings {
            catalog_region: self.catalog_region.clone(),
            image_name_filter: self.image_name_filter.clone(),
            image_owner: self.image_owner.clone(),
            ingress_port: self.ssh_port,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            endpoint: self.endpoint.clone(),
        }
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            connect_timeout: Duration::from_secs(self.ssh_connect_timeout_secs),
            command_timeout: Duration::from_secs(self.remote_command_timeout_secs),
        }
    }

    pub fn poller(&self) -> Poller {
        Poller::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.request_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CliConfig::load_or_default(&dir.path().join("config.json")).expect("load");
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.ssh_user, "ubuntu");
        assert_eq!(config.poller().interval, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"ssh_port": 2222, "poll_interval_secs": 1}"#).expect("write");

        let config = CliConfig::load_or_default(&path).expect("load");
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.ec2_settings().ingress_port, 2222);
        assert_eq!(config.ssh_settings().port, 2222);
        assert_eq!(config.poll_interval_secs, 1);
        assert_eq!(config.catalog_region, "eu-central-1");
    }

    #[test]
    fn test_endpoint_override_reaches_ec2_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"endpoint": "http://127.0.0.1:4566"}"#).expect("write");

        let config = CliConfig::load(&path).expect("load");
        assert_eq!(
            config.ec2_settings().endpoint.as_deref(),
            Some("http://127.0.0.1:4566")
        );
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(CliConfig::load_or_default(&path), Err(CliError::Config(_))));
    }
}
