use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::info;

use crate::cluster::{ClusterBackend, ProvisionedHost};
use crate::config::DataCenterConfig;
use crate::error::HailstormError;
use crate::model::{ClusterKind, JmeterPlan, LoadAgent};
use crate::remote::{HostSpec, RemoteExecutor};

/// Static fleet backend over a fixed machine list (C3 §4.2.2).
///
/// Agent capacity equals the machine count; hosts are never created or
/// destroyed, so `terminate` only releases the binding.
pub struct DataCenterBackend {
    cluster_id: i64,
    config: DataCenterConfig,
    executor: RemoteExecutor,
    connect_timeout: Duration,
}

impl DataCenterBackend {
    pub fn new(cluster_id: i64, config: DataCenterConfig, executor: RemoteExecutor) -> Self {
        Self {
            cluster_id,
            config,
            executor,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn spec_for(&self, machine: &str) -> HostSpec {
        HostSpec::new(
            machine,
            self.config.ssh_port,
            self.config.user_name.clone(),
            self.config.ssh_identity.clone(),
        )
    }
}

#[async_trait]
impl ClusterBackend for DataCenterBackend {
    fn kind(&self) -> ClusterKind {
        ClusterKind::DataCenter
    }

    fn cluster_id(&self) -> i64 {
        self.cluster_id
    }

    /// Validate SSH reachability to every declared machine. Failures are
    /// aggregated so the operator sees the whole picture at once.
    async fn setup(&self) -> Result<(), HailstormError> {
        let probes = self.config.machines.iter().map(|machine| {
            let spec = self.spec_for(machine);
            let executor = self.executor.clone();
            let timeout = self.connect_timeout;
            async move {
                let result = executor.ensure_connectivity(&spec, timeout).await;
                (machine.clone(), result)
            }
        });
        let results = join_all(probes).await;

        let unreachable: Vec<String> = results
            .into_iter()
            .filter_map(|(machine, result)| result.err().map(|e| format!("{machine}: {e}")))
            .collect();
        if !unreachable.is_empty() {
            return Err(HailstormError::Setup(format!(
                "data_center '{}' machines unreachable: {}",
                self.config.title,
                unreachable.join("; ")
            )));
        }
        info!(
            cluster = %self.config.title,
            machines = self.config.machines.len(),
            "data center machines reachable"
        );
        Ok(())
    }

    fn required_agent_count(&self, _plan: &JmeterPlan) -> u32 {
        self.config.machines.len() as u32
    }

    async fn provision_agent(
        &self,
        in_use: &[String],
    ) -> Result<ProvisionedHost, HailstormError> {
        let machine = self
            .config
            .machines
            .iter()
            .find(|m| !in_use.iter().any(|used| used == *m))
            .ok_or_else(|| {
                HailstormError::Setup(format!(
                    "data_center '{}' has no unassigned machines left",
                    self.config.title
                ))
            })?;
        let spec = self.spec_for(machine);
        self.executor
            .ensure_connectivity(&spec, self.connect_timeout)
            .await?;
        Ok(ProvisionedHost {
            identifier: machine.clone(),
            public_ip: Some(machine.clone()),
            private_ip: None,
        })
    }

    async fn start_agent(
        &self,
        agent: &LoadAgent,
    ) -> Result<Option<ProvisionedHost>, HailstormError> {
        let Some(machine) = agent.identifier.as_deref() else {
            return Ok(None);
        };
        let spec = self.spec_for(machine);
        self.executor
            .ensure_connectivity(&spec, self.connect_timeout)
            .await?;
        Ok(Some(ProvisionedHost {
            identifier: machine.to_string(),
            public_ip: Some(machine.to_string()),
            private_ip: None,
        }))
    }

    /// Machines stay up; stopping an agent leaves the host untouched.
    async fn stop_agent(&self, _agent: &LoadAgent) -> Result<(), HailstormError> {
        Ok(())
    }

    /// Nothing to release on fixed hosts.
    async fn terminate_agent(&self, _agent: &LoadAgent) -> Result<(), HailstormError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), HailstormError> {
        Ok(())
    }

    fn host_spec(&self, agent: &LoadAgent) -> Result<HostSpec, HailstormError> {
        let machine = agent
            .identifier
            .as_deref()
            .or(agent.public_ip_address.as_deref())
            .ok_or_else(|| {
                HailstormError::Agent(format!("agent {} has no machine binding", agent.id))
            })?;
        Ok(self.spec_for(machine))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
