use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ClusterConfig, JmeterConfig};
use crate::error::HailstormError;
use crate::model::{ClusterKind, ClusterRow, JmeterPlan, LoadAgent, Project};
use crate::remote::{HostSpec, RemoteExecutor};
use crate::store::Store;

pub mod aws;
pub mod data_center;
pub mod ec2_cli;

pub use aws::{AwsClusterBackend, Ec2Api, Ec2Factory};
pub use data_center::DataCenterBackend;

// ---------------------------------------------------------------------------
// ClusterBackend — capability interface over the closed backend set
// ---------------------------------------------------------------------------

/// A freshly acquired (or restarted) agent host.
#[derive(Debug, Clone)]
pub struct ProvisionedHost {
    pub identifier: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

/// Capabilities every cluster backend provides (C3). Backends are a closed
/// enumeration — elastic AWS fleets and static data-center fleets — built
/// through [`backend_for`].
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn kind(&self) -> ClusterKind;

    /// Id of the owning cluster row.
    fn cluster_id(&self) -> i64;

    /// Reconcile backend prerequisites (key pair, security group, AMI,
    /// availability zone; or validated reachability for static fleets).
    async fn setup(&self) -> Result<(), HailstormError>;

    /// How many agents the plan needs on this cluster.
    fn required_agent_count(&self, plan: &JmeterPlan) -> u32;

    /// Acquire one new agent host. `in_use` lists identifiers already bound
    /// to agents of this cluster.
    async fn provision_agent(&self, in_use: &[String])
        -> Result<ProvisionedHost, HailstormError>;

    /// Bring an existing agent's host to the running state. Idempotent;
    /// returns refreshed addresses when the host had to be (re)started.
    async fn start_agent(
        &self,
        agent: &LoadAgent,
    ) -> Result<Option<ProvisionedHost>, HailstormError>;

    /// Stop the agent's host. Idempotent; missing hosts are ignored.
    async fn stop_agent(&self, agent: &LoadAgent) -> Result<(), HailstormError>;

    /// Release the agent's host for good. Idempotent; missing hosts are
    /// ignored.
    async fn terminate_agent(&self, agent: &LoadAgent) -> Result<(), HailstormError>;

    /// Hook fired by the owning manager before the agent row is deleted.
    async fn before_destroy_load_agent(&self, agent: &LoadAgent) -> Result<(), HailstormError> {
        self.terminate_agent(agent).await
    }

    /// Delete auto-created key pairs, identity files and other backend
    /// resources.
    async fn cleanup(&self) -> Result<(), HailstormError>;

    /// SSH endpoint for one of this cluster's agents.
    fn host_spec(&self, agent: &LoadAgent) -> Result<HostSpec, HailstormError>;

    /// Remote directory agents stage plans and results in.
    fn remote_work_dir(&self, project_code: &str) -> String {
        format!("hailstorm/{project_code}")
    }
}

/// Stable identity of a configured cluster within a project.
pub fn cluster_slug(config: &ClusterConfig) -> String {
    match config {
        ClusterConfig::AmazonCloud(aws) => format!("amazon_cloud-{}", aws.region),
        ClusterConfig::DataCenter(dc) => format!(
            "data_center-{}",
            crate::model::slugify_project_code(&dc.title)
        ),
    }
}

/// Build the backend for one configured cluster.
pub fn backend_for(
    row: &ClusterRow,
    config: &ClusterConfig,
    project: &Project,
    jmeter: &JmeterConfig,
    executor: RemoteExecutor,
    ec2_factory: &dyn Ec2Factory,
    store: Store,
) -> Arc<dyn ClusterBackend> {
    match config {
        ClusterConfig::AmazonCloud(aws_config) => Arc::new(AwsClusterBackend::new(
            row.id,
            aws_config.clone(),
            project.clone(),
            jmeter.clone(),
            ec2_factory.ec2(aws_config),
            executor,
            store,
        )),
        ClusterConfig::DataCenter(dc_config) => Arc::new(DataCenterBackend::new(
            row.id,
            dc_config.clone(),
            executor,
        )),
    }
}

// ---------------------------------------------------------------------------
// Agent-count arithmetic
// ---------------------------------------------------------------------------

/// Round a per-agent thread capacity to its band's granularity:
/// multiples of 5 up to 10, of 10 up to 50, of 50 above that.
/// Idempotent, and never rounds to zero.
pub fn round_off_max_threads_per_agent(value: u32) -> u32 {
    if value == 0 {
        return 0;
    }
    let step = if value <= 10 {
        5
    } else if value <= 50 {
        10
    } else {
        50
    };
    let rounded = ((value + step / 2) / step) * step;
    rounded.max(step)
}

/// Per-agent thread capacity derived from the instance type, used when the
/// cluster config does not override it. Non-decreasing across sizes within a
/// family and always within `[3, 10000]`.
pub fn default_max_threads_per_agent(instance_type: &str) -> u32 {
    let size = instance_type.split('.').nth(1).unwrap_or("");
    let base = match size {
        "nano" => 3,
        "micro" => 5,
        "small" => 10,
        "medium" => 20,
        "large" => 50,
        "xlarge" => 100,
        "metal" => 5000,
        other => other
            .strip_suffix("xlarge")
            .and_then(|n| n.parse::<u32>().ok())
            .map(|n| n.saturating_mul(100).min(10_000))
            .unwrap_or(50),
    };
    round_off_max_threads_per_agent(base).clamp(3, 10_000)
}

/// Agents needed to drive `num_threads` at `max_threads_per_agent` each.
/// Depends on nothing else; monotonically non-decreasing in `num_threads`.
pub fn required_agent_count(num_threads: u32, max_threads_per_agent: u32) -> u32 {
    if num_threads == 0 || max_threads_per_agent == 0 {
        return 0;
    }
    (num_threads + max_threads_per_agent - 1) / max_threads_per_agent
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
