//! Deploy target configuration
//!
//! Every knob the tool needs lives in one structure loaded from a TOML
//! file, with the credential overridable from the environment and the
//! most common fields overridable from the command line. Nothing about
//! the target is baked into source.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How the web server is kept running once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// `nohup ... &` - survives the session, not a reboot.
    Detached,
    /// systemd unit with auto-restart, enabled for boot.
    Supervised,
}

/// What an unverified port does to the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyPolicy {
    /// Report the failed check but still exit zero.
    Soft,
    /// An unverified port fails the run.
    Strict,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    pub host: String,
    #[serde(default = "defaults::ssh_port")]
    pub port: u16,
    pub username: String,
    /// Password auth. `SLIPWAY_PASSWORD` in the environment wins over
    /// anything written in the file.
    #[serde(default)]
    pub password: Option<String>,
    /// Private key auth, tried before the password when both are set.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Remote directory whose contents are replaced wholesale each run.
    pub remote_root: String,
    #[serde(default = "defaults::local_dist")]
    pub local_dist: PathBuf,
    /// Port the static server must end up listening on.
    pub web_port: u16,
    #[serde(default = "defaults::asset_dir")]
    pub asset_dir: String,
    /// systemd unit name for the supervised strategy. Derived from the
    /// port when absent.
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default = "defaults::strategy")]
    pub strategy: Strategy,
    #[serde(default = "defaults::verify")]
    pub verify: VerifyPolicy,
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Delay between starting the server and checking the port.
    #[serde(default = "defaults::settle_secs")]
    pub settle_secs: u64,
    /// Delay after killing a previous instance.
    #[serde(default = "defaults::stop_settle_secs")]
    pub stop_settle_secs: u64,
    /// Open the web port in ufw/iptables (best effort).
    #[serde(default)]
    pub open_firewall: bool,
}

mod defaults {
    use super::{Strategy, VerifyPolicy};
    use std::path::PathBuf;

    pub fn ssh_port() -> u16 {
        22
    }
    pub fn local_dist() -> PathBuf {
        PathBuf::from("dist")
    }
    pub fn asset_dir() -> String {
        "assets".to_string()
    }
    pub fn strategy() -> Strategy {
        Strategy::Detached
    }
    pub fn verify() -> VerifyPolicy {
        VerifyPolicy::Soft
    }
    pub fn connect_timeout_secs() -> u64 {
        30
    }
    pub fn settle_secs() -> u64 {
        3
    }
    pub fn stop_settle_secs() -> u64 {
        2
    }
}

impl DeployConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut cfg: DeployConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Environment overrides, so the credential can stay out of the file.
    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var("SLIPWAY_PASSWORD") {
            if !password.is_empty() {
                self.password = Some(password);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("config: host must not be empty");
        }
        if self.username.is_empty() {
            bail!("config: username must not be empty");
        }
        if self.password.is_none() && self.key_file.is_none() {
            bail!("config: no authentication configured (set password, SLIPWAY_PASSWORD, or key_file)");
        }
        if !self.remote_root.starts_with('/') {
            bail!("config: remote_root must be an absolute path, got {:?}", self.remote_root);
        }
        if self.web_port == 0 {
            bail!("config: web_port must not be 0");
        }
        Ok(())
    }

    /// Unit name used by the supervised strategy.
    pub fn service_unit_name(&self) -> String {
        self.service_name
            .clone()
            .unwrap_or_else(|| format!("slipway-{}", self.web_port))
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.web_port)
    }
}
