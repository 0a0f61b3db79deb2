use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::digest::sha256_hex;
use crate::error::HailstormError;

// ---------------------------------------------------------------------------
// JmeterConfig
// ---------------------------------------------------------------------------

/// Which JMeter runtime to install on agents: a released version from the
/// Apache archive, or a custom installer tarball.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JmeterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_installer_url: Option<String>,
    /// Property overrides applied to every plan, merged under per-plan
    /// properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

const MIN_SUPPORTED_VERSION: (u32, u32) = (2, 6);

impl JmeterConfig {
    /// Validate version/installer settings, returning all problems found.
    pub fn validate(&self) -> Vec<HailstormError> {
        let mut errors = Vec::new();

        match (&self.version, &self.custom_installer_url) {
            (None, None) => errors.push(HailstormError::Configuration(
                "either jmeter.version or jmeter.custom_installer_url is required".to_string(),
            )),
            (Some(version), _) => {
                if !version_pattern().is_match(version) {
                    errors.push(HailstormError::Configuration(format!(
                        "jmeter.version '{version}' must look like MAJOR.MINOR or MAJOR.MINOR.PATCH"
                    )));
                } else if !version_at_least(version, MIN_SUPPORTED_VERSION) {
                    errors.push(HailstormError::Configuration(format!(
                        "jmeter.version '{version}' is older than the minimum supported 2.6"
                    )));
                }
            }
            (None, Some(url)) => {
                if !(url.ends_with(".tgz") || url.ends_with(".tar.gz")) {
                    errors.push(HailstormError::Configuration(format!(
                        "jmeter.custom_installer_url '{url}' must end with .tgz or .tar.gz"
                    )));
                }
            }
        }

        errors
    }

    /// The version string used for AMI naming and install paths.
    ///
    /// For a custom installer the version is extracted from the file name
    /// (`<family>-jmeter-<version>.tgz`); when the name does not match that
    /// shape the whole file stem is used.
    pub fn effective_version(&self) -> Option<String> {
        if let Some(version) = &self.version {
            return Some(version.clone());
        }
        let url = self.custom_installer_url.as_deref()?;
        let file_name = url.rsplit('/').next()?;
        let stem = file_name
            .strip_suffix(".tar.gz")
            .or_else(|| file_name.strip_suffix(".tgz"))
            .unwrap_or(file_name);
        let re = Regex::new(r"^[A-Za-z0-9]+-jmeter-(.+)$").expect("literal regex");
        match re.captures(stem) {
            Some(caps) => Some(caps[1].to_string()),
            None => Some(stem.to_string()),
        }
    }

    /// Whether agents are provisioned from a custom installer tarball.
    pub fn has_custom_installer(&self) -> bool {
        self.version.is_none() && self.custom_installer_url.is_some()
    }
}

fn version_pattern() -> Regex {
    Regex::new(r"^\d+\.\d+(\.\d+)?$").expect("literal regex")
}

fn version_at_least(version: &str, min: (u32, u32)) -> bool {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor) >= min
}

// ---------------------------------------------------------------------------
// Cluster configurations
// ---------------------------------------------------------------------------

fn default_user_name() -> String {
    "ubuntu".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_active() -> bool {
    true
}

/// Elastic (AWS) cluster declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AmazonCloudConfig {
    pub access_key: String,
    pub secret_key: String,
    /// Path to the SSH private key used to reach agents.
    pub ssh_identity: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Pre-built agent AMI; built on demand when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_ami: Option<String>,
    pub instance_type: String,
    /// Overrides the derived per-instance thread capacity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_threads_by_instance: Option<u32>,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default)]
    pub security_group: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl AmazonCloudConfig {
    pub fn validate(&self) -> Vec<HailstormError> {
        let mut errors = Vec::new();

        if self.access_key.trim().is_empty() || self.secret_key.trim().is_empty() {
            errors.push(HailstormError::Configuration(
                "amazon_cloud requires access_key and secret_key".to_string(),
            ));
        }
        if self.region.trim().is_empty() {
            errors.push(HailstormError::Configuration(
                "amazon_cloud requires a region".to_string(),
            ));
        }

        let instance_type_pattern =
            Regex::new(r"^[a-z][a-z0-9-]*\.[a-z0-9]+$").expect("literal regex");
        if !instance_type_pattern.is_match(&self.instance_type) {
            errors.push(HailstormError::Configuration(format!(
                "instance_type '{}' must be of the form <family>.<size>",
                self.instance_type
            )));
        }

        // A non-standard SSH port implies a customised image; the stock agent
        // AMI only listens on 22.
        if self.active && self.ssh_port != 22 && self.agent_ami.is_none() {
            errors.push(HailstormError::Configuration(format!(
                "agent_ami must be supplied when ssh_port is {} (not 22)",
                self.ssh_port
            )));
        }

        errors
    }

    /// The `<family>` component of the instance type.
    pub fn instance_family(&self) -> &str {
        self.instance_type
            .split('.')
            .next()
            .unwrap_or(&self.instance_type)
    }

    /// The `<size>` component of the instance type.
    pub fn instance_size(&self) -> &str {
        self.instance_type.split('.').nth(1).unwrap_or("")
    }

    /// The security group name, defaulted when not configured.
    pub fn security_group_name(&self) -> String {
        self.security_group
            .clone()
            .unwrap_or_else(|| "Hailstorm".to_string())
    }

    /// The key pair name derived from the identity file path.
    pub fn key_pair_name(&self) -> String {
        std::path::Path::new(&self.ssh_identity)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.ssh_identity.clone())
    }
}

/// Static (data-center) cluster declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DataCenterConfig {
    pub title: String,
    pub user_name: String,
    pub ssh_identity: String,
    pub machines: Vec<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl DataCenterConfig {
    pub fn validate(&self) -> Vec<HailstormError> {
        let mut errors = Vec::new();
        if self.machines.is_empty() {
            errors.push(HailstormError::Configuration(format!(
                "data_center '{}' must declare at least one machine",
                self.title
            )));
        }
        if self.user_name.trim().is_empty() {
            errors.push(HailstormError::Configuration(format!(
                "data_center '{}' requires a user_name",
                self.title
            )));
        }
        errors
    }
}

/// One declared cluster, dispatched on `cluster_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cluster_type", rename_all = "snake_case")]
pub enum ClusterConfig {
    AmazonCloud(AmazonCloudConfig),
    DataCenter(DataCenterConfig),
}

impl ClusterConfig {
    pub fn kind(&self) -> crate::model::ClusterKind {
        match self {
            ClusterConfig::AmazonCloud(_) => crate::model::ClusterKind::AmazonCloud,
            ClusterConfig::DataCenter(_) => crate::model::ClusterKind::DataCenter,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            ClusterConfig::AmazonCloud(c) => c.active,
            ClusterConfig::DataCenter(c) => c.active,
        }
    }

    pub fn validate(&self) -> Vec<HailstormError> {
        match self {
            ClusterConfig::AmazonCloud(c) => c.validate(),
            ClusterConfig::DataCenter(c) => c.validate(),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetHostConfig
// ---------------------------------------------------------------------------

fn default_sampling_interval() -> u32 {
    10
}

/// A server-side host to monitor during load generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TargetHostConfig {
    pub host_name: String,
    pub role_name: String,
    /// Monitor backend, e.g. `vmstat`.
    pub monitor_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_secs: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl TargetHostConfig {
    pub fn validate(&self) -> Vec<HailstormError> {
        let mut errors = Vec::new();
        if self.host_name.trim().is_empty() {
            errors.push(HailstormError::Configuration(
                "target_host requires a host_name".to_string(),
            ));
        }
        if self.sampling_interval_secs == 0 {
            errors.push(HailstormError::Configuration(format!(
                "target_host '{}': sampling_interval must be at least 1 second",
                self.host_name
            )));
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

fn default_max_threads_per_agent() -> u32 {
    50
}

fn default_breakup_interval() -> String {
    "1,3,5".to_string()
}

fn default_true() -> bool {
    true
}

fn default_pool_size() -> usize {
    50
}

/// Complete declared configuration for one project — the input to `setup`.
///
/// Its [`serial_version`](Self::serial_version) fingerprint decides whether
/// setup needs to run again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProjectConfig {
    #[serde(default = "default_true")]
    pub master_slave_mode: bool,
    #[serde(default = "default_max_threads_per_agent")]
    pub max_threads_per_agent: u32,
    #[serde(default = "default_breakup_interval")]
    pub samples_breakup_interval: String,
    pub jmeter: JmeterConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub target_hosts: Vec<TargetHostConfig>,
    /// Upper bound on concurrent per-agent/per-cluster tasks.
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,
}

impl ProjectConfig {
    /// Validate the whole declaration, returning every problem found.
    ///
    /// An empty `Vec` means the configuration is usable.
    pub fn validate(&self) -> Vec<HailstormError> {
        let mut errors = Vec::new();
        errors.extend(self.jmeter.validate());
        for cluster in &self.clusters {
            errors.extend(cluster.validate());
        }
        for target in &self.target_hosts {
            errors.extend(target.validate());
        }
        if self.max_threads_per_agent == 0 {
            errors.push(HailstormError::Configuration(
                "max_threads_per_agent must be at least 1".to_string(),
            ));
        }
        errors
    }

    /// Stable fingerprint of this configuration. Two configs with equal
    /// fingerprints need no re-setup.
    pub fn serial_version(&self) -> String {
        // serde_json emits struct fields in declaration order and the maps
        // here are BTreeMaps, so the serialisation is canonical.
        let encoded = serde_json::to_string(self).unwrap_or_default();
        sha256_hex(encoded.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
