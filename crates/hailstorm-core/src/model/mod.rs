use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CycleStatus — lifecycle of one execution cycle
// ---------------------------------------------------------------------------

/// Status of an [`ExecutionCycle`].
///
/// A project has at most one `Started` cycle at any time. `Terminated`,
/// `Reported` and `Excluded` are terminal except for the explicit
/// `excluded ↔ stopped` toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Started,
    Stopped,
    Aborted,
    Terminated,
    Excluded,
    Reported,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Started => "started",
            CycleStatus::Stopped => "stopped",
            CycleStatus::Aborted => "aborted",
            CycleStatus::Terminated => "terminated",
            CycleStatus::Excluded => "excluded",
            CycleStatus::Reported => "reported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(CycleStatus::Started),
            "stopped" => Some(CycleStatus::Stopped),
            "aborted" => Some(CycleStatus::Aborted),
            "terminated" => Some(CycleStatus::Terminated),
            "excluded" => Some(CycleStatus::Excluded),
            "reported" => Some(CycleStatus::Reported),
            _ => None,
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AgentRole / ClusterKind
// ---------------------------------------------------------------------------

/// Role of a load agent. In master-slave mode exactly one `Master` per
/// (cluster, plan) starts the test and the `Slave`s receive commands over RMI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Master,
    Slave,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Master => "master",
            AgentRole::Slave => "slave",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "master" => Some(AgentRole::Master),
            "slave" => Some(AgentRole::Slave),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Discriminator for the concrete cluster backend a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    AmazonCloud,
    DataCenter,
}

impl ClusterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterKind::AmazonCloud => "amazon_cloud",
            ClusterKind::DataCenter => "data_center",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "amazon_cloud" => Some(ClusterKind::AmazonCloud),
            "data_center" => Some(ClusterKind::DataCenter),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A load-test project. Owns clusters, plans, target hosts and cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub project_code: String,
    pub max_threads_per_agent: u32,
    pub master_slave_mode: bool,
    /// Comma-separated response-time boundaries (seconds) for the breakup
    /// histogram, e.g. `1,3,5`.
    pub samples_breakup_interval: String,
    /// Fingerprint of the last successfully applied configuration.
    /// `None` means setup is required.
    pub serial_version: Option<String>,
}

impl Project {
    /// Parse `samples_breakup_interval` into numeric boundaries, skipping
    /// malformed entries.
    pub fn breakup_intervals(&self) -> Vec<u32> {
        self.samples_breakup_interval
            .split(',')
            .filter_map(|s| s.trim().parse::<u32>().ok())
            .collect()
    }
}

/// Turn an arbitrary project name into a store-safe code: every
/// non-alphanumeric character becomes `_`.
pub fn slugify_project_code(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// One JMeter test plan registered with a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JmeterPlan {
    pub id: i64,
    pub project_id: i64,
    pub test_plan_name: String,
    pub content_hash: String,
    pub active: bool,
    /// JMeter property overrides, serialised as a JSON object.
    pub properties: String,
    pub latest_threads_count: Option<u32>,
}

impl JmeterPlan {
    /// Decode the properties JSON into key/value pairs. Malformed or
    /// non-object content yields an empty map.
    pub fn properties_map(&self) -> std::collections::BTreeMap<String, String> {
        serde_json::from_str::<std::collections::BTreeMap<String, serde_json::Value>>(
            &self.properties,
        )
        .map(|m| {
            m.into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Abstract cluster row; the concrete configuration lives in the project
/// config snapshot keyed by `(kind, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRow {
    pub id: i64,
    pub project_id: i64,
    pub kind: ClusterKind,
    /// Adopted or built agent AMI (elastic clusters only).
    pub agent_ami: Option<String>,
}

/// A remote host running the load-generation runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadAgent {
    pub id: i64,
    pub clusterable_id: i64,
    pub clusterable_kind: ClusterKind,
    pub jmeter_plan_id: i64,
    pub public_ip_address: Option<String>,
    pub private_ip_address: Option<String>,
    pub active: bool,
    pub role: AgentRole,
    pub jmeter_pid: Option<u32>,
    /// Backend-specific handle: EC2 instance id, or machine hostname.
    pub identifier: Option<String>,
}

impl LoadAgent {
    pub fn is_master(&self) -> bool {
        self.role == AgentRole::Master
    }

    /// Whether a generator process is (last known to be) running here.
    pub fn is_running(&self) -> bool {
        self.jmeter_pid.is_some()
    }
}

/// A server-side machine measured by a monitor during a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHost {
    pub id: i64,
    pub project_id: i64,
    pub host_name: String,
    pub role_name: String,
    /// Monitor backend discriminator, e.g. `vmstat`.
    pub monitor_kind: String,
    pub executable_path: Option<String>,
    pub executable_pid: Option<u32>,
    pub ssh_identity: Option<String>,
    pub user_name: Option<String>,
    pub sampling_interval_secs: u32,
    pub active: bool,
}

/// One run from `start` to `stop`/`abort`/`terminate` — the unit of reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCycle {
    pub id: i64,
    pub project_id: i64,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub threads_count: Option<u32>,
}

impl ExecutionCycle {
    /// Cycles eligible for inclusion in a report.
    pub fn is_reportable(&self) -> bool {
        matches!(self.status, CycleStatus::Stopped | CycleStatus::Reported)
    }
}

/// Per (cycle × plan × clusterable) aggregate of generator-side samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStat {
    pub id: i64,
    pub execution_cycle_id: i64,
    pub jmeter_plan_id: i64,
    pub clusterable_id: i64,
    pub clusterable_kind: ClusterKind,
    pub threads_count: u32,
    pub aggregate_ninety_percentile: f64,
    pub aggregate_response_throughput: f64,
    pub last_sample_at: Option<DateTime<Utc>>,
}

/// Per page-label statistics under one [`ClientStat`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStat {
    pub id: i64,
    pub client_stat_id: i64,
    pub page_label: String,
    pub samples_count: u64,
    pub average_response_time: f64,
    pub median_response_time: f64,
    pub ninety_percentile_response_time: f64,
    pub minimum_response_time: f64,
    pub maximum_response_time: f64,
    pub percentage_errors: f64,
    pub response_throughput: f64,
    pub size_throughput: f64,
    pub standard_deviation: f64,
    /// Response-time distribution keyed by the project's breakup intervals,
    /// serialised as JSON.
    pub samples_breakup_json: String,
}

/// Per (cycle × target host) summary of monitor samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStat {
    pub id: i64,
    pub execution_cycle_id: i64,
    pub target_host_id: i64,
    pub average_cpu_usage: f64,
    pub average_memory_usage: f64,
    pub average_swap_usage: Option<f64>,
    pub cpu_usage_trend: Option<String>,
    pub memory_usage_trend: Option<String>,
    pub swap_usage_trend: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
