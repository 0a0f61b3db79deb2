use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::cluster::ClusterBackend;
use crate::error::HailstormError;
use crate::model::{AgentRole, JmeterPlan, LoadAgent};
use crate::remote::{wait_for, RemoteExecutor};
use crate::store::Store;
use crate::workspace::agent_slug;

// ---------------------------------------------------------------------------
// AgentManager
// ---------------------------------------------------------------------------

/// Drives load agents through their lifecycle on behalf of one cluster
/// backend: reconcile counts, deploy plan artefacts, start and stop the
/// generator, collect results, release hosts (C4).
#[derive(Clone)]
pub struct AgentManager {
    store: Store,
    executor: RemoteExecutor,
    stop_wait_timeout: Duration,
}

impl AgentManager {
    pub fn new(store: Store, executor: RemoteExecutor) -> Self {
        Self {
            store,
            executor,
            stop_wait_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_stop_wait_timeout(mut self, timeout: Duration) -> Self {
        self.stop_wait_timeout = timeout;
        self
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Reconcile the plan's agents on `backend` to the required count:
    /// re-enable disabled agents first, provision what is still missing,
    /// disable the surplus, and enforce the master/slave invariant.
    ///
    /// Returns the active agents after reconciliation.
    pub async fn reconcile(
        &self,
        backend: &dyn ClusterBackend,
        plan: &JmeterPlan,
        master_slave_mode: bool,
    ) -> Result<Vec<LoadAgent>, HailstormError> {
        let desired = backend.required_agent_count(plan) as usize;
        let mut agents =
            self.store
                .agents_for_plan(backend.cluster_id(), backend.kind(), plan.id)?;

        let active_count = agents.iter().filter(|a| a.active).count();

        if active_count < desired {
            let mut shortfall = desired - active_count;

            // Disabled agents come back first; their hosts may need a restart.
            for agent in agents.iter().filter(|a| !a.active) {
                if shortfall == 0 {
                    break;
                }
                if let Some(host) = backend.start_agent(agent).await? {
                    self.store.update_agent_addresses(
                        agent.id,
                        host.public_ip.as_deref(),
                        host.private_ip.as_deref(),
                    )?;
                }
                self.store.update_agent_active(agent.id, true)?;
                info!(agent = agent.id, "re-enabled agent");
                shortfall -= 1;
            }

            // Provision the rest.
            for _ in 0..shortfall {
                let in_use: Vec<String> = self
                    .store
                    .agents_for_plan(backend.cluster_id(), backend.kind(), plan.id)?
                    .iter()
                    .filter_map(|a| a.identifier.clone())
                    .collect();
                let host = backend.provision_agent(&in_use).await?;
                let role = if master_slave_mode {
                    AgentRole::Slave
                } else {
                    AgentRole::Master
                };
                let agent = self.store.insert_load_agent(
                    backend.cluster_id(),
                    backend.kind(),
                    plan.id,
                    role,
                    Some(&host.identifier),
                    host.public_ip.as_deref(),
                    host.private_ip.as_deref(),
                )?;
                info!(agent = agent.id, identifier = %host.identifier, "created agent");
            }
        } else if active_count > desired {
            for surplus in agents_to_remove(&agents, desired)
                .into_iter()
                .filter(|a| a.active)
            {
                backend.stop_agent(&surplus).await?;
                self.store.update_agent_active(surplus.id, false)?;
                info!(agent = surplus.id, "disabled surplus agent");
            }
        }

        agents = self
            .store
            .agents_for_plan(backend.cluster_id(), backend.kind(), plan.id)?;
        if master_slave_mode {
            self.enforce_single_master(plan, &agents)?;
            agents = self
                .store
                .agents_for_plan(backend.cluster_id(), backend.kind(), plan.id)?;
        }
        Ok(agents.into_iter().filter(|a| a.active).collect())
    }

    /// In master-slave mode exactly one active Master may exist per
    /// (cluster, plan); two or more is a conflict the operator must resolve.
    fn enforce_single_master(
        &self,
        plan: &JmeterPlan,
        agents: &[LoadAgent],
    ) -> Result<(), HailstormError> {
        let active: Vec<&LoadAgent> = agents.iter().filter(|a| a.active).collect();
        let masters: Vec<&&LoadAgent> = active.iter().filter(|a| a.is_master()).collect();
        match masters.len() {
            0 => {
                if let Some(first) = active.first() {
                    self.store.update_agent_role(first.id, AgentRole::Master)?;
                }
                Ok(())
            }
            1 => Ok(()),
            _ => Err(HailstormError::MasterSlaveConflict(
                plan.test_plan_name.clone(),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Deployment
    // -----------------------------------------------------------------------

    /// Upload the plan, its data files, and the generated properties file to
    /// every agent's work directory. Content hashes skip unchanged artefacts.
    pub async fn deploy(
        &self,
        backend: &dyn ClusterBackend,
        plan: &JmeterPlan,
        agents: &[LoadAgent],
        project_code: &str,
        local_plan_path: &Path,
        data_files: &[PathBuf],
        staging_dir: &Path,
    ) -> Result<(), HailstormError> {
        let work_dir = backend.remote_work_dir(project_code);
        let properties_path = staging_dir.join(format!("{}.properties", plan.id));
        tokio::fs::create_dir_all(staging_dir).await?;
        tokio::fs::write(&properties_path, properties_file_content(&plan.properties_map()))
            .await?;

        for agent in agents.iter().filter(|a| a.active) {
            let host = backend.host_spec(agent)?;
            self.executor
                .exec_checked(&host, &format!("mkdir -p {work_dir}"))
                .await?;
            self.executor
                .upload_idempotent(
                    &host,
                    local_plan_path,
                    &format!("{work_dir}/{}", plan.test_plan_name),
                )
                .await?;
            self.executor
                .upload_idempotent(
                    &host,
                    &properties_path,
                    &format!("{work_dir}/jmeter.properties"),
                )
                .await?;
            for data_file in data_files {
                let file_name = data_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        HailstormError::Agent(format!(
                            "data file {} has no file name",
                            data_file.display()
                        ))
                    })?;
                self.executor
                    .upload_idempotent(&host, data_file, &format!("{work_dir}/{file_name}"))
                    .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run / stop / collect
    // -----------------------------------------------------------------------

    /// Start the generator. Slaves come up first so the master can reach
    /// them over RMI; each recorded pid marks the agent as running.
    pub async fn start_load(
        &self,
        backend: &dyn ClusterBackend,
        plan: &JmeterPlan,
        agents: &[LoadAgent],
        project_code: &str,
        master_slave_mode: bool,
    ) -> Result<(), HailstormError> {
        let work_dir = backend.remote_work_dir(project_code);
        let active: Vec<&LoadAgent> = agents.iter().filter(|a| a.active).collect();
        let slaves: Vec<&&LoadAgent> = active.iter().filter(|a| !a.is_master()).collect();
        let masters: Vec<&&LoadAgent> = active.iter().filter(|a| a.is_master()).collect();

        if master_slave_mode {
            for slave in &slaves {
                let host = backend.host_spec(slave)?;
                let command = format!(
                    "cd {work_dir} && nohup $HOME/apache-jmeter-*/bin/jmeter-server \
                     > jmeter-server.out 2>&1 & echo $!"
                );
                let out = self.executor.exec_checked(&host, &command).await?;
                let pid = parse_pid(&out.stdout).ok_or_else(|| {
                    HailstormError::Agent(format!(
                        "could not read jmeter-server pid on {}",
                        host.host
                    ))
                })?;
                self.store.update_agent_pid(slave.id, Some(pid))?;
            }
        }

        for master in &masters {
            let host = backend.host_spec(master)?;
            let mut command = format!(
                "cd {work_dir} && nohup $HOME/apache-jmeter-*/bin/jmeter -n \
                 -t {plan} -q jmeter.properties -l results.jtl -j jmeter.log",
                plan = plan.test_plan_name
            );
            if master_slave_mode && !slaves.is_empty() {
                let remote_hosts: Vec<String> = slaves
                    .iter()
                    .filter_map(|s| s.private_ip_address.clone().or(s.public_ip_address.clone()))
                    .collect();
                command.push_str(&format!(" -R {}", remote_hosts.join(",")));
            }
            command.push_str(" > jmeter.out 2>&1 & echo $!");
            let out = self.executor.exec_checked(&host, &command).await?;
            let pid = parse_pid(&out.stdout).ok_or_else(|| {
                HailstormError::Agent(format!("could not read jmeter pid on {}", host.host))
            })?;
            self.store.update_agent_pid(master.id, Some(pid))?;
            info!(agent = master.id, pid, "started load generation");
        }
        Ok(())
    }

    /// Stop the generator on every running agent. With `wait` the call
    /// blocks until each process is gone; with `force` the processes are
    /// killed outright.
    pub async fn stop_load(
        &self,
        backend: &dyn ClusterBackend,
        agents: &[LoadAgent],
        wait: bool,
        force: bool,
    ) -> Result<(), HailstormError> {
        for agent in agents {
            let Some(pid) = agent.jmeter_pid else {
                continue;
            };
            let host = backend.host_spec(agent)?;
            let signal = if force { "-9" } else { "-15" };
            // The process may have exited on its own; a failed kill is fine.
            let _ = self
                .executor
                .exec(&host, &format!("kill {signal} {pid}"))
                .await?;

            if wait && !force {
                let executor = self.executor.clone();
                let host_probe = host.clone();
                wait_for(
                    &format!("jmeter exit on {}", host.host),
                    self.stop_wait_timeout,
                    Duration::from_secs(2),
                    move || {
                        let executor = executor.clone();
                        let host = host_probe.clone();
                        async move {
                            let out = executor.exec(&host, &format!("kill -0 {pid}")).await?;
                            Ok(!out.success())
                        }
                    },
                )
                .await?;
            }
            self.store.update_agent_pid(agent.id, None)?;
        }
        Ok(())
    }

    /// Probe which of the given agents still run a generator process.
    /// Probes run in parallel; unreachable agents count as not running.
    pub async fn check_status(
        &self,
        backend: &dyn ClusterBackend,
        agents: &[LoadAgent],
    ) -> Result<Vec<LoadAgent>, HailstormError> {
        let probes = agents
            .iter()
            .filter(|a| a.active && a.jmeter_pid.is_some())
            .map(|agent| {
                let executor = self.executor.clone();
                let agent = agent.clone();
                let host = backend.host_spec(&agent);
                async move {
                    let Ok(host) = host else { return None };
                    let pid = agent.jmeter_pid.unwrap_or(0);
                    match executor.exec(&host, &format!("kill -0 {pid}")).await {
                        Ok(out) if out.success() => Some(agent),
                        Ok(_) => None,
                        Err(err) => {
                            warn!(agent = agent.id, %err, "status probe failed");
                            None
                        }
                    }
                }
            });
        Ok(join_all(probes).await.into_iter().flatten().collect())
    }

    /// Pull each running master's result file into the cycle directory as
    /// `<agent-slug>.jtl`. Returns the local paths written.
    pub async fn collect_results(
        &self,
        backend: &dyn ClusterBackend,
        agents: &[LoadAgent],
        project_code: &str,
        cycle_dir: &Path,
    ) -> Result<Vec<PathBuf>, HailstormError> {
        let work_dir = backend.remote_work_dir(project_code);
        let mut collected = Vec::new();
        for agent in agents.iter().filter(|a| a.active && a.is_master()) {
            let host = backend.host_spec(agent)?;
            let slug = agent_slug(
                agent.identifier.as_deref(),
                agent.public_ip_address.as_deref(),
                agent.id,
            );
            let local = cycle_dir.join(format!("{slug}.jtl"));
            self.executor
                .download(&host, &format!("{work_dir}/results.jtl"), &local)
                .await?;
            // Clear the remote file so the next cycle starts fresh.
            self.executor
                .exec(&host, &format!("rm -f {work_dir}/results.jtl"))
                .await?;
            collected.push(local);
        }
        Ok(collected)
    }

    /// Stop the underlying hosts and forget their public addresses.
    pub async fn suspend(
        &self,
        backend: &dyn ClusterBackend,
        agents: &[LoadAgent],
    ) -> Result<(), HailstormError> {
        for agent in agents.iter().filter(|a| a.active) {
            backend.stop_agent(agent).await?;
            self.store
                .update_agent_addresses(agent.id, None, agent.private_ip_address.as_deref())?;
        }
        Ok(())
    }

    /// Release every agent: fire the backend's destroy hook, then delete the
    /// row.
    pub async fn terminate(
        &self,
        backend: &dyn ClusterBackend,
        agents: &[LoadAgent],
    ) -> Result<(), HailstormError> {
        for agent in agents {
            backend.before_destroy_load_agent(agent).await?;
            self.store.delete_agent(agent.id)?;
            info!(agent = agent.id, "terminated agent");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Surplus agents to take out of service, lowest priority first: every
/// disabled agent, then the newest active ones beyond `desired`.
pub fn agents_to_remove(agents: &[LoadAgent], desired: usize) -> Vec<LoadAgent> {
    let mut result: Vec<LoadAgent> = agents.iter().filter(|a| !a.active).cloned().collect();
    let mut active: Vec<LoadAgent> = agents.iter().filter(|a| a.active).cloned().collect();
    active.sort_by_key(|a| std::cmp::Reverse(a.id));
    let surplus = active.len().saturating_sub(desired);
    result.extend(active.into_iter().take(surplus));
    result
}

/// First integer on the first non-empty line — how `echo $!` reports the
/// background pid.
fn parse_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .find(|line| !line.trim().is_empty())?
        .trim()
        .parse()
        .ok()
}

/// Render a JMeter `.properties` file from the merged property map.
pub fn properties_file_content(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ProvisionedHost;
    use crate::model::ClusterKind;
    use crate::remote::testing::FakeShell;
    use crate::remote::{HostSpec, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Backend double with a configurable desired count and a provision
    /// counter, addressing agents as plain hostnames.
    struct FakeBackend {
        cluster_id: i64,
        desired: u32,
        provisioned: AtomicU32,
    }

    impl FakeBackend {
        fn new(desired: u32) -> Self {
            Self {
                cluster_id: 1,
                desired,
                provisioned: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ClusterBackend for FakeBackend {
        fn kind(&self) -> ClusterKind {
            ClusterKind::DataCenter
        }

        fn cluster_id(&self) -> i64 {
            self.cluster_id
        }

        async fn setup(&self) -> Result<(), HailstormError> {
            Ok(())
        }

        fn required_agent_count(&self, _plan: &JmeterPlan) -> u32 {
            self.desired
        }

        async fn provision_agent(
            &self,
            _in_use: &[String],
        ) -> Result<ProvisionedHost, HailstormError> {
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(ProvisionedHost {
                identifier: format!("host-{n}"),
                public_ip: Some(format!("10.1.0.{}", n + 1)),
                private_ip: Some(format!("10.0.0.{}", n + 1)),
            })
        }

        async fn start_agent(
            &self,
            agent: &LoadAgent,
        ) -> Result<Option<ProvisionedHost>, HailstormError> {
            Ok(agent.identifier.as_ref().map(|id| ProvisionedHost {
                identifier: id.clone(),
                public_ip: Some("10.1.0.99".to_string()),
                private_ip: None,
            }))
        }

        async fn stop_agent(&self, _agent: &LoadAgent) -> Result<(), HailstormError> {
            Ok(())
        }

        async fn terminate_agent(&self, _agent: &LoadAgent) -> Result<(), HailstormError> {
            Ok(())
        }

        async fn cleanup(&self) -> Result<(), HailstormError> {
            Ok(())
        }

        fn host_spec(&self, agent: &LoadAgent) -> Result<HostSpec, HailstormError> {
            let host = agent
                .public_ip_address
                .as_deref()
                .or(agent.identifier.as_deref())
                .ok_or_else(|| HailstormError::Agent("no address".to_string()))?;
            Ok(HostSpec::new(host, 22, "loadtest", "/keys/id.pem"))
        }
    }

    struct Fixture {
        manager: AgentManager,
        store: Store,
        shell: Arc<FakeShell>,
        plan: JmeterPlan,
    }

    fn make_fixture() -> Fixture {
        let store = Store::open_in_memory().expect("store");
        let project = store.find_or_create_project("shop").expect("project");
        let plan = store
            .upsert_jmeter_plan(project.id, "checkout.jmx", "hash", "{}", Some(150))
            .expect("plan");
        let shell = Arc::new(FakeShell::new());
        let executor = RemoteExecutor::with_policy(
            shell.clone(),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
        );
        let manager = AgentManager::new(store.clone(), executor)
            .with_stop_wait_timeout(Duration::from_millis(100));
        Fixture {
            manager,
            store,
            shell,
            plan,
        }
    }

    fn agents_in_store(fixture: &Fixture) -> Vec<LoadAgent> {
        fixture
            .store
            .agents_for_plan(1, ClusterKind::DataCenter, fixture.plan.id)
            .expect("agents")
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn reconcile_creates_agents_up_to_desired() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(3);

        let active = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|a| a.active));
        // Without master-slave mode every agent drives its own load.
        assert!(active.iter().all(|a| a.is_master()));
    }

    #[tokio::test]
    async fn reconcile_reenables_disabled_before_creating() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(2);

        fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("initial");
        let agents = agents_in_store(&fixture);
        fixture
            .store
            .update_agent_active(agents[0].id, false)
            .expect("disable");

        fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("second");
        let agents = agents_in_store(&fixture);
        // Still two rows: the disabled one was re-enabled, not replaced.
        assert_eq!(agents.len(), 2);
        assert!(agents.iter().all(|a| a.active));
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reconcile_disables_surplus_newest_first() {
        let fixture = make_fixture();
        let grow = FakeBackend::new(3);
        fixture
            .manager
            .reconcile(&grow, &fixture.plan, false)
            .await
            .expect("grow");

        let shrink = FakeBackend::new(1);
        let active = fixture
            .manager
            .reconcile(&shrink, &fixture.plan, false)
            .await
            .expect("shrink");
        assert_eq!(active.len(), 1);

        let agents = agents_in_store(&fixture);
        let oldest_id = agents.iter().map(|a| a.id).min().expect("agents exist");
        let survivor = agents.iter().find(|a| a.active).expect("one active");
        assert_eq!(survivor.id, oldest_id);
    }

    #[tokio::test]
    async fn reconcile_promotes_single_master_in_master_slave_mode() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(3);
        let active = fixture
            .manager
            .reconcile(&backend, &fixture.plan, true)
            .await
            .expect("reconcile");

        let masters = active.iter().filter(|a| a.is_master()).count();
        assert_eq!(masters, 1);
        assert_eq!(active.len(), 3);
    }

    #[tokio::test]
    async fn reconcile_rejects_two_preexisting_masters() {
        let fixture = make_fixture();
        for n in 0..2 {
            fixture
                .store
                .insert_load_agent(
                    1,
                    ClusterKind::DataCenter,
                    fixture.plan.id,
                    AgentRole::Master,
                    Some(&format!("host-{n}")),
                    None,
                    None,
                )
                .expect("agent");
        }
        let backend = FakeBackend::new(2);
        let result = fixture
            .manager
            .reconcile(&backend, &fixture.plan, true)
            .await;
        assert!(matches!(
            result,
            Err(HailstormError::MasterSlaveConflict(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_is_stable_at_desired_count() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(2);
        fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("first");
        fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("second");
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 2);
        assert_eq!(agents_in_store(&fixture).len(), 2);
    }

    // -----------------------------------------------------------------------
    // agents_to_remove
    // -----------------------------------------------------------------------

    fn make_agent(id: i64, active: bool) -> LoadAgent {
        LoadAgent {
            id,
            clusterable_id: 1,
            clusterable_kind: ClusterKind::DataCenter,
            jmeter_plan_id: 1,
            public_ip_address: None,
            private_ip_address: None,
            active,
            role: AgentRole::Master,
            jmeter_pid: None,
            identifier: None,
        }
    }

    #[test]
    fn agents_to_remove_prefers_disabled_then_newest() {
        let agents = vec![
            make_agent(1, true),
            make_agent(2, false),
            make_agent(3, true),
            make_agent(4, true),
        ];
        let removals = agents_to_remove(&agents, 2);
        let ids: Vec<i64> = removals.iter().map(|a| a.id).collect();
        // Disabled #2 first, then newest active #4.
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn agents_to_remove_empty_when_at_or_below_desired() {
        let agents = vec![make_agent(1, true), make_agent(2, true)];
        assert!(agents_to_remove(&agents, 2).is_empty());
        assert!(agents_to_remove(&agents, 5).is_empty());
    }

    // -----------------------------------------------------------------------
    // Deployment
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn deploy_uploads_plan_properties_and_data_files() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(1);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");

        let dir = tempfile::tempdir().expect("tempdir");
        let plan_path = dir.path().join("checkout.jmx");
        tokio::fs::write(&plan_path, b"<jmeterTestPlan/>")
            .await
            .expect("plan file");
        let data_path = dir.path().join("users.csv");
        tokio::fs::write(&data_path, b"user,pass\n").await.expect("data file");

        fixture
            .manager
            .deploy(
                &backend,
                &fixture.plan,
                &agents,
                "shop",
                &plan_path,
                &[data_path],
                dir.path(),
            )
            .await
            .expect("deploy");

        assert_eq!(fixture.shell.upload_count(), 3);
        assert!(!fixture.shell.commands_matching("mkdir -p hailstorm/shop").is_empty());
    }

    #[tokio::test]
    async fn deploy_skips_unchanged_artefacts_on_second_run() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(1);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");

        let dir = tempfile::tempdir().expect("tempdir");
        let plan_path = dir.path().join("checkout.jmx");
        tokio::fs::write(&plan_path, b"<jmeterTestPlan/>")
            .await
            .expect("plan file");

        for _ in 0..2 {
            fixture
                .manager
                .deploy(
                    &backend,
                    &fixture.plan,
                    &agents,
                    "shop",
                    &plan_path,
                    &[],
                    dir.path(),
                )
                .await
                .expect("deploy");
        }
        // Plan and properties each uploaded exactly once.
        assert_eq!(fixture.shell.upload_count(), 2);
    }

    // -----------------------------------------------------------------------
    // Run / stop / status / collect
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn start_load_records_master_pid() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(1);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");

        fixture.shell.script("echo $!", "4242\n", 0);
        fixture
            .manager
            .start_load(&backend, &fixture.plan, &agents, "shop", false)
            .await
            .expect("start");

        let stored = agents_in_store(&fixture);
        assert_eq!(stored[0].jmeter_pid, Some(4242));
        assert!(!fixture.shell.commands_matching("-t checkout.jmx").is_empty());
    }

    #[tokio::test]
    async fn start_load_in_master_slave_mode_passes_remote_hosts() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(3);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, true)
            .await
            .expect("reconcile");

        fixture.shell.script("echo $!", "99\n", 0);
        fixture
            .manager
            .start_load(&backend, &fixture.plan, &agents, "shop", true)
            .await
            .expect("start");

        // Two slaves started, one master with -R slave list.
        assert_eq!(fixture.shell.commands_matching("jmeter-server").len(), 2);
        let master_commands = fixture.shell.commands_matching(" -R ");
        assert_eq!(master_commands.len(), 1);
        assert!(master_commands[0].contains(','));
    }

    #[tokio::test]
    async fn stop_load_clears_pid() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(1);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");
        fixture.shell.script("echo $!", "4242\n", 0);
        fixture
            .manager
            .start_load(&backend, &fixture.plan, &agents, "shop", false)
            .await
            .expect("start");

        let running = agents_in_store(&fixture);
        // kill -0 reports the process gone.
        fixture.shell.script("kill -0", "", 1);
        fixture
            .manager
            .stop_load(&backend, &running, true, false)
            .await
            .expect("stop");

        let stored = agents_in_store(&fixture);
        assert!(stored[0].jmeter_pid.is_none());
        assert!(!fixture.shell.commands_matching("kill -15 4242").is_empty());
    }

    #[tokio::test]
    async fn stop_load_force_uses_sigkill() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(1);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");
        fixture.shell.script("echo $!", "77\n", 0);
        fixture
            .manager
            .start_load(&backend, &fixture.plan, &agents, "shop", false)
            .await
            .expect("start");

        let running = agents_in_store(&fixture);
        fixture
            .manager
            .stop_load(&backend, &running, false, true)
            .await
            .expect("stop");
        assert!(!fixture.shell.commands_matching("kill -9 77").is_empty());
    }

    #[tokio::test]
    async fn check_status_reports_live_pids_only() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(2);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");
        fixture
            .store
            .update_agent_pid(agents[0].id, Some(100))
            .expect("pid");
        fixture
            .store
            .update_agent_pid(agents[1].id, Some(200))
            .expect("pid");

        // Only pid 100 is alive.
        fixture.shell.script("kill -0 100", "", 0);
        fixture.shell.script("kill -0 200", "", 1);

        let stored = agents_in_store(&fixture);
        let live = fixture
            .manager
            .check_status(&backend, &stored)
            .await
            .expect("status");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].jmeter_pid, Some(100));
    }

    #[tokio::test]
    async fn collect_results_downloads_per_master_jtl() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(2);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");

        fixture
            .shell
            .serve_download("hailstorm/shop/results.jtl", b"timeStamp,elapsed\n");
        let dir = tempfile::tempdir().expect("tempdir");
        let collected = fixture
            .manager
            .collect_results(&backend, &agents, "shop", dir.path())
            .await
            .expect("collect");

        assert_eq!(collected.len(), 2);
        for path in &collected {
            assert!(path.exists());
            assert!(path.extension().is_some_and(|e| e == "jtl"));
        }
    }

    #[tokio::test]
    async fn terminate_deletes_rows() {
        let fixture = make_fixture();
        let backend = FakeBackend::new(2);
        let agents = fixture
            .manager
            .reconcile(&backend, &fixture.plan, false)
            .await
            .expect("reconcile");

        fixture
            .manager
            .terminate(&backend, &agents)
            .await
            .expect("terminate");
        assert!(agents_in_store(&fixture).is_empty());
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[test]
    fn parse_pid_reads_first_number() {
        assert_eq!(parse_pid("4242\n"), Some(4242));
        assert_eq!(parse_pid("\n  77  \n"), Some(77));
        assert_eq!(parse_pid("not a pid"), None);
        assert_eq!(parse_pid(""), None);
    }

    #[test]
    fn properties_file_renders_sorted_pairs() {
        let mut map = BTreeMap::new();
        map.insert("zeta".to_string(), "1".to_string());
        map.insert("alpha".to_string(), "two".to_string());
        let content = properties_file_content(&map);
        assert_eq!(content, "alpha=two\nzeta=1\n");
    }
}
