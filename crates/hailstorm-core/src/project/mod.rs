use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentManager;
use crate::cluster::{backend_for, cluster_slug, ClusterBackend, Ec2Factory};
use crate::config::{ClusterConfig, ProjectConfig};
use crate::cycle::CycleController;
use crate::digest::file_sha256;
use crate::error::HailstormError;
use crate::model::{
    slugify_project_code, ExecutionCycle, JmeterPlan, LoadAgent, Project,
};
use crate::monitor::MonitorManager;
use crate::remote::RemoteExecutor;
use crate::results::report::{create_report, ReportRenderer, TextReportRenderer};
use crate::results::{export, ingest_samples, jtl};
use crate::store::Store;
use crate::testplan::PlanParser;
use crate::workspace::Workspace;

// ---------------------------------------------------------------------------
// AppContext
// ---------------------------------------------------------------------------

/// Everything a command needs, threaded explicitly instead of living in
/// globals: the store, the workspace, the remote executor, and the
/// collaborator seams.
#[derive(Clone)]
pub struct AppContext {
    pub store: Store,
    pub workspace: Workspace,
    pub executor: RemoteExecutor,
    pub ec2_factory: Arc<dyn Ec2Factory>,
    pub plan_parser: Arc<dyn PlanParser>,
}

// ---------------------------------------------------------------------------
// Command inputs / outputs
// ---------------------------------------------------------------------------

/// Sub-operations of the `results` command.
#[derive(Debug, Clone)]
pub enum ResultsOp {
    Show {
        cycle_ids: Option<Vec<i64>>,
    },
    Exclude {
        cycle_id: i64,
    },
    Include {
        cycle_id: i64,
    },
    Export {
        cycle_ids: Option<Vec<i64>>,
        destination: Option<PathBuf>,
    },
    Import {
        file: PathBuf,
        plan_name: Option<String>,
        cluster: Option<String>,
        cycle_id: Option<i64>,
    },
    Report {
        cycle_ids: Option<Vec<i64>>,
    },
}

#[derive(Debug, Clone)]
pub enum ResultsOutcome {
    Cycles(Vec<ExecutionCycle>),
    Excluded(i64),
    Included(i64),
    Exported { path: PathBuf, files: usize },
    Imported { cycle_id: i64 },
    Reported { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeScope {
    /// Destroy all execution cycles and their stats.
    Tests,
    /// Destroy the project row; everything owned cascades.
    All,
}

// ---------------------------------------------------------------------------
// Advisory lock guard
// ---------------------------------------------------------------------------

struct ProjectLock {
    store: Store,
    project_id: i64,
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(err) = self.store.unlock_project(self.project_id) {
            warn!(project = self.project_id, %err, "failed to release project lock");
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectCoordinator
// ---------------------------------------------------------------------------

/// Top-level command façade (C7): `setup / start / stop / abort / terminate /
/// results / status / purge`, orchestrating clusters, agents, monitors and
/// the cycle state machine. One command per project runs at a time, enforced
/// by an advisory lock in the store.
pub struct ProjectCoordinator {
    ctx: AppContext,
    cycles: CycleController,
    agents: AgentManager,
    monitors: MonitorManager,
    cancel: CancellationToken,
}

impl ProjectCoordinator {
    pub fn new(ctx: AppContext) -> Self {
        let cycles = CycleController::new(ctx.store.clone());
        let agents = AgentManager::new(ctx.store.clone(), ctx.executor.clone());
        let monitors = MonitorManager::new(ctx.store.clone(), ctx.executor.clone());
        Self {
            ctx,
            cycles,
            agents,
            monitors,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts in-flight work cooperatively; workers observe it at
    /// their next suspension point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // -----------------------------------------------------------------------
    // setup
    // -----------------------------------------------------------------------

    /// Apply the declared configuration. Re-runs only when the configuration
    /// fingerprint changed or `force` is set; any failure nulls the
    /// project's `serial_version` so the next command retries discovery.
    pub async fn setup(
        &self,
        project_name: &str,
        config: &ProjectConfig,
        force: bool,
    ) -> Result<Project, HailstormError> {
        let code = slugify_project_code(project_name);
        let project = self.ctx.store.find_or_create_project(&code)?;
        let _lock = self.lock(&project)?;
        self.setup_inner(&project, config, force).await?;
        self.ctx
            .store
            .find_project(&code)?
            .ok_or(HailstormError::Store(rusqlite::Error::QueryReturnedNoRows))
    }

    async fn setup_inner(
        &self,
        project: &Project,
        config: &ProjectConfig,
        force: bool,
    ) -> Result<bool, HailstormError> {
        let serial = config.serial_version();
        let current = self.ctx.store.find_project(&project.project_code)?;
        if !force
            && current.as_ref().and_then(|p| p.serial_version.as_deref())
                == Some(serial.as_str())
        {
            debug!(project = %project.project_code, "configuration unchanged, skipping setup");
            return Ok(false);
        }

        match self.apply_setup(project, config).await {
            Ok(()) => {
                self.ctx.store.set_serial_version(project.id, Some(&serial))?;
                info!(project = %project.project_code, "setup complete");
                Ok(true)
            }
            Err(err) => {
                // A project without a serial_version must have no active
                // agents; the next successful setup re-enables them.
                self.deactivate_agents(project.id)?;
                self.ctx.store.set_serial_version(project.id, None)?;
                Err(err)
            }
        }
    }

    fn deactivate_agents(&self, project_id: i64) -> Result<(), HailstormError> {
        for agent in self.ctx.store.agents_for_project(project_id)? {
            if agent.active {
                self.ctx.store.update_agent_active(agent.id, false)?;
            }
        }
        Ok(())
    }

    async fn apply_setup(
        &self,
        project: &Project,
        config: &ProjectConfig,
    ) -> Result<(), HailstormError> {
        let errors = config.validate();
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(HailstormError::Configuration(messages.join("; ")));
        }

        self.ctx
            .workspace
            .ensure_project_dirs(&project.project_code)
            .await?;
        self.ctx.store.update_project_settings(
            project.id,
            config.max_threads_per_agent,
            config.master_slave_mode,
            &config.samples_breakup_interval,
        )?;

        self.load_plans(project, config).await?;
        self.configure_clusters(project, config).await?;
        self.configure_targets(project, config).await?;
        Ok(())
    }

    /// Scan the bundle directory for plans; register new ones, refresh
    /// changed ones, and deactivate plans no longer shipped.
    async fn load_plans(
        &self,
        project: &Project,
        config: &ProjectConfig,
    ) -> Result<Vec<JmeterPlan>, HailstormError> {
        let app_dir = self.ctx.workspace.app_dir(&project.project_code);
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&app_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jmx") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut names = Vec::new();
        let mut plans = Vec::new();
        for path in paths {
            let parsed = self.ctx.plan_parser.parse(&path)?;
            let content_hash = file_sha256(&path).await?;
            let mut properties = config.jmeter.properties.clone();
            properties.extend(parsed.properties.clone());
            let properties_json = serde_json::to_string(&properties)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let plan = self.ctx.store.upsert_jmeter_plan(
                project.id,
                &name,
                &content_hash,
                &properties_json,
                Some(parsed.threads_count),
            )?;
            names.push(name);
            plans.push(plan);
        }
        self.ctx.store.deactivate_plans_not_in(project.id, &names)?;

        if plans.is_empty() {
            return Err(HailstormError::Setup(format!(
                "no .jmx test plans found in {}",
                app_dir.display()
            )));
        }
        Ok(plans)
    }

    /// Set every active cluster up, one task per cluster under the worker
    /// pool. Partial failures are logged and aggregated.
    async fn configure_clusters(
        &self,
        project: &Project,
        config: &ProjectConfig,
    ) -> Result<(), HailstormError> {
        let backends = self.active_backends(project, config)?;
        let semaphore = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        let mut tasks: JoinSet<(i64, Result<(), HailstormError>)> = JoinSet::new();
        for backend in backends {
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (backend.cluster_id(), backend.setup().await)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((cluster_id, Err(err))) => {
                    warn!(cluster = cluster_id, %err, "cluster setup failed");
                    failures.push(format!("cluster {cluster_id}: {err}"));
                }
                Err(join_err) => failures.push(format!("cluster task failed: {join_err}")),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(HailstormError::Setup(failures.join("; ")))
        }
    }

    async fn configure_targets(
        &self,
        project: &Project,
        config: &ProjectConfig,
    ) -> Result<(), HailstormError> {
        let mut keep = Vec::new();
        for target in config.target_hosts.iter().filter(|t| t.active) {
            self.ctx.store.upsert_target_host(
                project.id,
                &target.host_name,
                &target.role_name,
                &target.monitor_type,
                target.executable_path.as_deref(),
                target.ssh_identity.as_deref(),
                target.user_name.as_deref(),
                target.sampling_interval_secs,
            )?;
            keep.push((target.host_name.clone(), target.role_name.clone()));
        }
        self.ctx.store.deactivate_targets_not_in(project.id, &keep)?;
        self.monitors.install_all(project.id).await
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Open a new cycle and bring the fleet up: implicit setup, monitors
    /// first, then load generation. Any failure aborts the cycle.
    pub async fn start(
        &self,
        project_name: &str,
        config: &ProjectConfig,
        redeploy: bool,
    ) -> Result<ExecutionCycle, HailstormError> {
        let code = slugify_project_code(project_name);
        let project = self.ctx.store.find_or_create_project(&code)?;
        let _lock = self.lock(&project)?;

        if self.ctx.store.current_cycle(project.id)?.is_some() {
            return Err(HailstormError::ExecutionCycleExists(code));
        }
        let cycle = self.cycles.begin(&project, None)?;

        match self.run_start(&project, config, redeploy).await {
            Ok(threads) => {
                self.ctx.store.set_cycle_threads(cycle.id, threads)?;
                self.ctx
                    .store
                    .find_cycle(project.id, cycle.id)?
                    .ok_or(HailstormError::Store(rusqlite::Error::QueryReturnedNoRows))
            }
            Err(err) => {
                self.cycles.mark_aborted(&cycle)?;
                Err(err)
            }
        }
    }

    async fn run_start(
        &self,
        project: &Project,
        config: &ProjectConfig,
        redeploy: bool,
    ) -> Result<u32, HailstormError> {
        self.setup_inner(project, config, redeploy).await?;
        // Settings may have changed during setup.
        let project = self
            .ctx
            .store
            .find_project(&project.project_code)?
            .ok_or(HailstormError::Store(rusqlite::Error::QueryReturnedNoRows))?;

        self.monitors.start_all(project.id).await?;
        self.generate_load(&project, config).await
    }

    async fn generate_load(
        &self,
        project: &Project,
        config: &ProjectConfig,
    ) -> Result<u32, HailstormError> {
        let plans = self.ctx.store.active_plans(project.id)?;
        let backends = self.active_backends(project, config)?;
        let app_dir = self.ctx.workspace.app_dir(&project.project_code);
        let staging_dir = self.ctx.workspace.tmp_dir(&project.project_code);

        let mut total_threads = 0u32;
        for backend in &backends {
            for plan in &plans {
                if self.cancel.is_cancelled() {
                    return Err(HailstormError::Agent(
                        "load generation cancelled".to_string(),
                    ));
                }
                let agents = self
                    .agents
                    .reconcile(backend.as_ref(), plan, project.master_slave_mode)
                    .await?;

                let plan_path = app_dir.join(&plan.test_plan_name);
                let parsed = self.ctx.plan_parser.parse(&plan_path)?;
                let data_files: Vec<PathBuf> = parsed
                    .data_files
                    .iter()
                    .map(|name| app_dir.join(name))
                    .filter(|path| path.is_file())
                    .collect();

                self.agents
                    .deploy(
                        backend.as_ref(),
                        plan,
                        &agents,
                        &project.project_code,
                        &plan_path,
                        &data_files,
                        &staging_dir,
                    )
                    .await?;
                self.agents
                    .start_load(
                        backend.as_ref(),
                        plan,
                        &agents,
                        &project.project_code,
                        project.master_slave_mode,
                    )
                    .await?;
                total_threads += plan.latest_threads_count.unwrap_or(0);
            }
        }
        Ok(total_threads)
    }

    // -----------------------------------------------------------------------
    // stop / abort
    // -----------------------------------------------------------------------

    /// Stop the current cycle: load generation first, monitors after —
    /// monitors are stopped even when the load stop fails, but then without
    /// writing target stats. A clean stop collects results and marks the
    /// cycle `stopped`; any failure marks it `aborted` and surfaces.
    pub async fn stop(
        &self,
        project_name: &str,
        config: &ProjectConfig,
        wait: bool,
        suspend: bool,
    ) -> Result<ExecutionCycle, HailstormError> {
        let project = self.existing_project(project_name)?;
        let _lock = self.lock(&project)?;
        let cycle = self.cycles.require_current(&project)?;

        let load_result = self
            .stop_load_and_collect(&project, config, &cycle, wait, false)
            .await;
        let staging_dir = self.ctx.workspace.tmp_dir(&project.project_code);
        let monitor_result = self
            .monitors
            .stop_all(
                project.id,
                Some(&cycle),
                &staging_dir,
                load_result.is_ok(),
            )
            .await;

        match load_result.and(monitor_result) {
            Ok(()) => {
                self.cycles.mark_stopped(&cycle)?;
                if suspend {
                    self.suspend_agents(&project, config).await?;
                }
                self.ctx
                    .store
                    .find_cycle(project.id, cycle.id)?
                    .ok_or(HailstormError::Store(rusqlite::Error::QueryReturnedNoRows))
            }
            Err(err) => {
                self.cycles.mark_aborted(&cycle)?;
                Err(err)
            }
        }
    }

    /// Forceful stop: generators are killed, monitors stopped without
    /// recording target stats, no results collected, cycle `aborted`.
    pub async fn abort(
        &self,
        project_name: &str,
        config: &ProjectConfig,
        suspend: bool,
    ) -> Result<(), HailstormError> {
        let project = self.existing_project(project_name)?;
        let _lock = self.lock(&project)?;
        let cycle = self.cycles.require_current(&project)?;

        let load_result = self
            .stop_load_and_collect(&project, config, &cycle, false, true)
            .await;
        let staging_dir = self.ctx.workspace.tmp_dir(&project.project_code);
        let monitor_result = self
            .monitors
            .stop_all(project.id, Some(&cycle), &staging_dir, false)
            .await;

        self.cycles.mark_aborted(&cycle)?;
        if suspend {
            self.suspend_agents(&project, config).await?;
        }
        load_result.and(monitor_result)
    }

    async fn stop_load_and_collect(
        &self,
        project: &Project,
        config: &ProjectConfig,
        cycle: &ExecutionCycle,
        wait: bool,
        force: bool,
    ) -> Result<(), HailstormError> {
        let plans = self.ctx.store.active_plans(project.id)?;
        let backends = self.active_backends(project, config)?;
        let cycle_dir = self
            .ctx
            .workspace
            .ensure_cycle_dir(&project.project_code, cycle.id)
            .await?;

        for backend in &backends {
            for plan in &plans {
                let agents: Vec<LoadAgent> = self
                    .ctx
                    .store
                    .agents_for_plan(backend.cluster_id(), backend.kind(), plan.id)?
                    .into_iter()
                    .filter(|a| a.active)
                    .collect();
                self.agents
                    .stop_load(backend.as_ref(), &agents, wait, force)
                    .await?;

                if !force {
                    let files = self
                        .agents
                        .collect_results(
                            backend.as_ref(),
                            &agents,
                            &project.project_code,
                            &cycle_dir,
                        )
                        .await?;
                    let mut samples = Vec::new();
                    for file in files {
                        samples.extend(jtl::read_jtl(&file)?);
                    }
                    ingest_samples(
                        &self.ctx.store,
                        cycle,
                        plan,
                        backend.cluster_id(),
                        backend.kind(),
                        &samples,
                        &project.breakup_intervals(),
                    )?;
                }
            }
        }
        Ok(())
    }

    async fn suspend_agents(
        &self,
        project: &Project,
        config: &ProjectConfig,
    ) -> Result<(), HailstormError> {
        let plans = self.ctx.store.active_plans(project.id)?;
        for backend in self.active_backends(project, config)? {
            for plan in &plans {
                let agents = self.ctx.store.agents_for_plan(
                    backend.cluster_id(),
                    backend.kind(),
                    plan.id,
                )?;
                self.agents.suspend(backend.as_ref(), &agents).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // terminate
    // -----------------------------------------------------------------------

    /// Release everything the backends hold (agents terminated, built AMIs
    /// kept), clear `serial_version`, and mark any current cycle
    /// `terminated`.
    pub async fn terminate(
        &self,
        project_name: &str,
        config: &ProjectConfig,
    ) -> Result<(), HailstormError> {
        let project = self.existing_project(project_name)?;
        let _lock = self.lock(&project)?;

        let all_agents = self.ctx.store.agents_for_project(project.id)?;
        for backend in self.active_backends(&project, config)? {
            let owned: Vec<LoadAgent> = all_agents
                .iter()
                .filter(|a| {
                    a.clusterable_id == backend.cluster_id()
                        && a.clusterable_kind == backend.kind()
                })
                .cloned()
                .collect();
            self.agents.terminate(backend.as_ref(), &owned).await?;
            backend.cleanup().await?;
        }
        self.monitors.terminate_all(project.id).await?;
        self.ctx.store.set_serial_version(project.id, None)?;

        if let Some(cycle) = self.ctx.store.current_cycle(project.id)? {
            self.cycles.mark_terminated(&cycle)?;
        }
        info!(project = %project.project_code, "terminated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // results
    // -----------------------------------------------------------------------

    pub async fn results(
        &self,
        project_name: &str,
        config: &ProjectConfig,
        op: ResultsOp,
    ) -> Result<ResultsOutcome, HailstormError> {
        let project = self.existing_project(project_name)?;
        match op {
            ResultsOp::Show { cycle_ids } => Ok(ResultsOutcome::Cycles(
                self.ctx.store.cycles(project.id, cycle_ids.as_deref())?,
            )),
            ResultsOp::Exclude { cycle_id } => {
                self.cycles.exclude(&project, cycle_id)?;
                Ok(ResultsOutcome::Excluded(cycle_id))
            }
            ResultsOp::Include { cycle_id } => {
                self.cycles.include(&project, cycle_id)?;
                Ok(ResultsOutcome::Included(cycle_id))
            }
            ResultsOp::Export {
                cycle_ids,
                destination,
            } => {
                let cycles = match cycle_ids {
                    Some(ids) => ids,
                    None => self
                        .cycles
                        .reportable(&project, None)?
                        .iter()
                        .map(|c| c.id)
                        .collect(),
                };
                let path = match destination {
                    Some(path) => path,
                    None => {
                        let dir = self.ctx.workspace.reports_dir(&project.project_code);
                        std::fs::create_dir_all(&dir)?;
                        dir.join(format!("{}-results.zip", project.project_code))
                    }
                };
                let files = export::export_cycles(
                    &self.ctx.workspace,
                    &project.project_code,
                    &cycles,
                    &path,
                )?;
                Ok(ResultsOutcome::Exported { path, files })
            }
            ResultsOp::Import {
                file,
                plan_name,
                cluster,
                cycle_id,
            } => {
                let plan = self.import_plan_selector(&project, plan_name.as_deref())?;
                let cluster_row = self.import_cluster_selector(
                    &project,
                    config,
                    cluster.as_deref(),
                )?;
                let cycle = export::import_jtl(
                    &self.ctx.store,
                    &self.ctx.workspace,
                    &project,
                    &plan,
                    cluster_row.0,
                    cluster_row.1,
                    cycle_id,
                    &file,
                )?;
                Ok(ResultsOutcome::Imported { cycle_id: cycle.id })
            }
            ResultsOp::Report { cycle_ids } => {
                let renderer: &dyn ReportRenderer = &TextReportRenderer;
                let path = create_report(
                    &self.ctx.store,
                    &self.ctx.workspace,
                    &project,
                    cycle_ids.as_deref(),
                    renderer,
                )?;
                Ok(ResultsOutcome::Reported { path })
            }
        }
    }

    fn import_plan_selector(
        &self,
        project: &Project,
        plan_name: Option<&str>,
    ) -> Result<JmeterPlan, HailstormError> {
        let plans = self.ctx.store.active_plans(project.id)?;
        match plan_name {
            Some(name) => self
                .ctx
                .store
                .plan_by_name(project.id, name)?
                .ok_or_else(|| {
                    HailstormError::IncorrectCommand(format!("no plan named '{name}'"))
                }),
            None => plans.into_iter().next().ok_or_else(|| {
                HailstormError::IncorrectCommand(
                    "project has no active plans to attach samples to".to_string(),
                )
            }),
        }
    }

    fn import_cluster_selector(
        &self,
        project: &Project,
        config: &ProjectConfig,
        selector: Option<&str>,
    ) -> Result<(i64, crate::model::ClusterKind), HailstormError> {
        let chosen: Option<&ClusterConfig> = match selector {
            Some(slug) => config
                .clusters
                .iter()
                .find(|c| cluster_slug(c) == slug || cluster_slug(c).contains(slug)),
            None => config.clusters.iter().find(|c| c.is_active()),
        };
        let cluster_config = chosen.ok_or_else(|| {
            HailstormError::IncorrectCommand("no cluster matches the import selector".to_string())
        })?;
        let row = self.ctx.store.find_or_create_cluster(
            project.id,
            cluster_config.kind(),
            &cluster_slug(cluster_config),
        )?;
        Ok((row.id, row.kind))
    }

    // -----------------------------------------------------------------------
    // status
    // -----------------------------------------------------------------------

    /// Live master agents (those whose recorded generator pid still runs),
    /// probed in parallel. Empty when no cycle is running.
    pub async fn status(
        &self,
        project_name: &str,
        config: &ProjectConfig,
    ) -> Result<Vec<LoadAgent>, HailstormError> {
        let project = self.existing_project(project_name)?;
        if self.ctx.store.current_cycle(project.id)?.is_none() {
            return Ok(Vec::new());
        }

        let plans = self.ctx.store.active_plans(project.id)?;
        let mut live = Vec::new();
        for backend in self.active_backends(&project, config)? {
            for plan in &plans {
                let masters: Vec<LoadAgent> = self
                    .ctx
                    .store
                    .agents_for_plan(backend.cluster_id(), backend.kind(), plan.id)?
                    .into_iter()
                    .filter(|a| a.active && a.is_master() && a.jmeter_pid.is_some())
                    .collect();
                live.extend(
                    self.agents
                        .check_status(backend.as_ref(), &masters)
                        .await?,
                );
            }
        }
        Ok(live)
    }

    // -----------------------------------------------------------------------
    // purge
    // -----------------------------------------------------------------------

    pub async fn purge(
        &self,
        project_name: &str,
        scope: PurgeScope,
    ) -> Result<(), HailstormError> {
        let project = self.existing_project(project_name)?;
        let _lock = self.lock(&project)?;
        match scope {
            PurgeScope::Tests => {
                let deleted = self.ctx.store.delete_cycles_for_project(project.id)?;
                self.ctx
                    .workspace
                    .purge_cycle_dirs(&project.project_code, &deleted)
                    .await?;
                info!(project = %project.project_code, cycles = deleted.len(), "purged cycles");
            }
            PurgeScope::All => {
                self.ctx.store.delete_project(project.id)?;
                self.ctx
                    .workspace
                    .purge_project(&project.project_code)
                    .await?;
                info!(project = %project.project_code, "purged project");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn existing_project(&self, project_name: &str) -> Result<Project, HailstormError> {
        let code = slugify_project_code(project_name);
        self.ctx.store.find_project(&code)?.ok_or_else(|| {
            HailstormError::Configuration(format!("project '{code}' has not been set up"))
        })
    }

    fn lock(&self, project: &Project) -> Result<ProjectLock, HailstormError> {
        if !self.ctx.store.try_lock_project(project.id)? {
            return Err(HailstormError::IncorrectCommand(format!(
                "another command is already running for project '{}'",
                project.project_code
            )));
        }
        Ok(ProjectLock {
            store: self.ctx.store.clone(),
            project_id: project.id,
        })
    }

    fn active_backends(
        &self,
        project: &Project,
        config: &ProjectConfig,
    ) -> Result<Vec<Arc<dyn ClusterBackend>>, HailstormError> {
        let mut backends = Vec::new();
        for cluster_config in config.clusters.iter().filter(|c| c.is_active()) {
            let row = self.ctx.store.find_or_create_cluster(
                project.id,
                cluster_config.kind(),
                &cluster_slug(cluster_config),
            )?;
            backends.push(backend_for(
                &row,
                cluster_config,
                project,
                &config.jmeter,
                self.ctx.executor.clone(),
                self.ctx.ec2_factory.as_ref(),
                self.ctx.store.clone(),
            ));
        }
        Ok(backends)
    }
}

// ---------------------------------------------------------------------------
// Tests — end-to-end scenarios over the in-crate fakes
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::aws::testing::{FakeEc2, FakeEc2Factory};
    use crate::config::{AmazonCloudConfig, JmeterConfig, TargetHostConfig};
    use crate::model::{AgentRole, ClusterKind, CycleStatus};
    use crate::remote::testing::FakeShell;
    use crate::remote::RetryPolicy;
    use crate::testplan::JmxPlanParser;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const PLAN_JMX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<jmeterTestPlan version="1.2">
  <hashTree>
    <ThreadGroup testname="Shoppers" enabled="true">
      <stringProp name="ThreadGroup.num_threads">150</stringProp>
    </ThreadGroup>
  </hashTree>
</jmeterTestPlan>
"#;

    const JTL: &str = "\
timeStamp,elapsed,label,responseCode,responseMessage,threadName,dataType,success,bytes
1700000000000,120,home,200,OK,t,text,true,2048
1700000001000,350,checkout,200,OK,t,text,true,4096
1700000002000,90,home,500,Err,t,text,false,512
";

    struct Fixture {
        coordinator: ProjectCoordinator,
        store: Store,
        workspace: Workspace,
        shell: Arc<FakeShell>,
        ec2: Arc<FakeEc2>,
        config: ProjectConfig,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn project(&self) -> Project {
            self.store
                .find_project("shop")
                .expect("query")
                .expect("project")
        }

        fn cycles(&self) -> Vec<ExecutionCycle> {
            self.store.cycles(self.project().id, None).expect("cycles")
        }
    }

    async fn make_fixture(master_slave_mode: bool) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(dir.path());

        // Seed the test-plan bundle the way an operator would.
        let app_dir = workspace.app_dir("shop");
        tokio::fs::create_dir_all(&app_dir).await.expect("app dir");
        tokio::fs::write(app_dir.join("shoppers.jmx"), PLAN_JMX)
            .await
            .expect("plan file");

        let store = Store::open_in_memory().expect("store");
        let shell = Arc::new(FakeShell::new());
        shell.script("echo $!", "4242\n", 0);
        shell.serve_download("hailstorm/shop/results.jtl", JTL.as_bytes());
        shell.serve_download(
            "/tmp/hailstorm-monitor-database.csv",
            b"10.0,40.0,0.0\n30.0,60.0,10.0\n",
        );

        let executor = RemoteExecutor::with_policy(
            shell.clone(),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
        );
        let ec2 = Arc::new(FakeEc2::new());

        let config = ProjectConfig {
            master_slave_mode,
            max_threads_per_agent: 50,
            samples_breakup_interval: "1,3,5".to_string(),
            jmeter: JmeterConfig {
                version: Some("5.6".to_string()),
                custom_installer_url: None,
                properties: BTreeMap::new(),
            },
            clusters: vec![ClusterConfig::AmazonCloud(AmazonCloudConfig {
                access_key: "A".to_string(),
                secret_key: "s".to_string(),
                ssh_identity: dir
                    .path()
                    .join("hailstorm.pem")
                    .to_string_lossy()
                    .into_owned(),
                region: "us-east-1".to_string(),
                zone: None,
                agent_ami: None,
                instance_type: "t3a.large".to_string(),
                max_threads_by_instance: Some(100),
                user_name: "ubuntu".to_string(),
                security_group: None,
                ssh_port: 22,
                active: true,
            })],
            target_hosts: vec![TargetHostConfig {
                host_name: "db-1".to_string(),
                role_name: "database".to_string(),
                monitor_type: "vmstat".to_string(),
                executable_path: None,
                ssh_identity: Some("/keys/dc.pem".to_string()),
                user_name: Some("root".to_string()),
                sampling_interval_secs: 10,
                active: true,
            }],
            worker_pool_size: 8,
        };

        let ctx = AppContext {
            store: store.clone(),
            workspace: workspace.clone(),
            executor,
            ec2_factory: Arc::new(FakeEc2Factory { ec2: ec2.clone() }),
            plan_parser: Arc::new(JmxPlanParser),
        };

        Fixture {
            coordinator: ProjectCoordinator::new(ctx),
            store,
            workspace,
            shell,
            ec2,
            config,
            dir,
        }
    }

    // -----------------------------------------------------------------------
    // S1 — happy path: start creates ceil(150/100)=2 agents, stop collects
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn happy_path_start_then_stop() {
        let fixture = make_fixture(false).await;

        let cycle = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");
        assert_eq!(cycle.status, CycleStatus::Started);
        assert_eq!(cycle.threads_count, Some(150));

        let agents = fixture
            .store
            .agents_for_project(fixture.project().id)
            .expect("agents");
        assert_eq!(agents.len(), 2, "ceil(150/100) agents");
        assert!(agents.iter().all(|a| a.active && a.jmeter_pid.is_some()));

        let stopped = fixture
            .coordinator
            .stop("shop", &fixture.config, false, false)
            .await
            .expect("stop");
        assert_eq!(stopped.status, CycleStatus::Stopped);
        assert!(stopped.stopped_at.is_some());

        // Both agents were collected into the cycle directory.
        let cycle_dir = fixture.workspace.cycle_results_dir("shop", cycle.id);
        let collected: Vec<_> = std::fs::read_dir(&cycle_dir)
            .expect("cycle dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(collected.len(), 2);

        // Page and client stats were written.
        let clients = fixture
            .store
            .client_stats_for_cycle(cycle.id)
            .expect("clients");
        assert_eq!(clients.len(), 1);
        let pages = fixture
            .store
            .page_stats_for_client(clients[0].id)
            .expect("pages");
        assert_eq!(pages.len(), 2);

        // Monitor samples became a target stat.
        let targets = fixture
            .store
            .target_stats_for_cycle(cycle.id)
            .expect("target stats");
        assert_eq!(targets.len(), 1);
    }

    // -----------------------------------------------------------------------
    // S2 — idempotent setup: second run performs zero cloud mutations
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn setup_twice_is_idempotent() {
        let fixture = make_fixture(true).await;

        let project = fixture
            .coordinator
            .setup("shop", &fixture.config, false)
            .await
            .expect("first setup");
        assert!(project.serial_version.is_some());
        assert!(fixture.ec2.mutations() > 0);

        fixture.ec2.reset_mutations();
        let again = fixture
            .coordinator
            .setup("shop", &fixture.config, false)
            .await
            .expect("second setup");
        assert_eq!(again.serial_version, project.serial_version);
        assert_eq!(fixture.ec2.mutations(), 0, "no cloud mutations on re-setup");
    }

    #[tokio::test]
    async fn setup_reruns_when_config_changes() {
        let fixture = make_fixture(true).await;
        fixture
            .coordinator
            .setup("shop", &fixture.config, false)
            .await
            .expect("first setup");

        let mut changed = fixture.config.clone();
        changed.max_threads_per_agent = 75;
        let project = fixture
            .coordinator
            .setup("shop", &changed, false)
            .await
            .expect("second setup");
        assert_eq!(project.max_threads_per_agent, 75);
        assert_ne!(
            project.serial_version,
            Some(fixture.config.serial_version())
        );
    }

    #[tokio::test]
    async fn failed_setup_deactivates_agents_when_nulling_serial() {
        let fixture = make_fixture(false).await;
        fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");
        fixture
            .coordinator
            .stop("shop", &fixture.config, false, false)
            .await
            .expect("stop");

        // Agents from the finished cycle stay active and configured.
        let project = fixture.project();
        assert!(project.serial_version.is_some());
        let agents = fixture.store.agents_for_project(project.id).expect("agents");
        assert!(!agents.is_empty());
        assert!(agents.iter().all(|a| a.active));

        // A later setup with a broken configuration must roll back.
        let mut bad = fixture.config.clone();
        bad.jmeter.version = Some("1.0".to_string());
        let result = fixture.coordinator.setup("shop", &bad, true).await;
        assert!(matches!(result, Err(HailstormError::Configuration(_))));

        // serial_version is null, so no agent may remain active.
        let project = fixture.project();
        assert!(project.serial_version.is_none());
        let agents = fixture.store.agents_for_project(project.id).expect("agents");
        assert!(agents.iter().all(|a| !a.active));
    }

    // -----------------------------------------------------------------------
    // S3 — abort on cloud failure during implicit setup
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn start_aborts_cycle_when_ami_build_fails() {
        let fixture = make_fixture(true).await;
        *fixture.ec2.fail_create_image.lock().unwrap() = true;

        let result = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await;
        assert!(result.is_err());

        // The builder instance was terminated despite the failure.
        let instances = fixture.ec2.instances.lock().unwrap();
        assert!(!instances.is_empty());
        assert!(instances
            .values()
            .all(|i| i.state == crate::cluster::aws::InstanceState::Terminated));
        drop(instances);

        // serial_version was rolled back and the cycle aborted.
        assert!(fixture.project().serial_version.is_none());
        let cycles = fixture.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].status, CycleStatus::Aborted);

        // Monitors never started.
        assert!(fixture
            .shell
            .commands_matching("hailstorm-monitor")
            .is_empty());
        let targets = fixture
            .store
            .active_target_hosts(fixture.project().id)
            .expect("targets");
        assert!(targets.iter().all(|t| t.executable_pid.is_none()));
    }

    // -----------------------------------------------------------------------
    // S4 — master-slave conflict aborts the cycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn start_rejects_two_preexisting_masters() {
        let fixture = make_fixture(true).await;
        fixture
            .coordinator
            .setup("shop", &fixture.config, false)
            .await
            .expect("setup");

        let project = fixture.project();
        let cluster = fixture.store.clusters_for(project.id).expect("clusters")[0].clone();
        let plan = fixture.store.active_plans(project.id).expect("plans")[0].clone();
        for n in 0..2 {
            fixture
                .store
                .insert_load_agent(
                    cluster.id,
                    ClusterKind::AmazonCloud,
                    plan.id,
                    AgentRole::Master,
                    Some(&format!("i-dupe{n}")),
                    Some(&format!("54.0.1.{n}")),
                    None,
                )
                .expect("agent");
        }

        let result = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await;
        assert!(matches!(
            result,
            Err(HailstormError::MasterSlaveConflict(_))
        ));
        let cycles = fixture.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].status, CycleStatus::Aborted);
    }

    // -----------------------------------------------------------------------
    // S5 — stop failure still stops monitors, aborts cycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stop_failure_still_stops_monitors_without_target_stats() {
        let fixture = make_fixture(false).await;
        let cycle = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");

        // Every SIGTERM to the generator fails at the transport level.
        fixture.shell.fail_transiently("kill -15");

        let result = fixture
            .coordinator
            .stop("shop", &fixture.config, false, false)
            .await;
        assert!(matches!(result, Err(HailstormError::TransientHost { .. })));

        // The cycle is aborted and no target stats were recorded.
        let cycles = fixture.cycles();
        assert_eq!(cycles[0].status, CycleStatus::Aborted);
        assert!(fixture
            .store
            .target_stats_for_cycle(cycle.id)
            .expect("stats")
            .is_empty());

        // But the monitor itself was stopped (its pid cleared).
        let targets = fixture
            .store
            .active_target_hosts(fixture.project().id)
            .expect("targets");
        assert!(targets.iter().all(|t| t.executable_pid.is_none()));
    }

    // -----------------------------------------------------------------------
    // S6 — export then import reproduces stats
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn export_then_import_through_results_command() {
        let fixture = make_fixture(false).await;
        let cycle = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");
        fixture
            .coordinator
            .stop("shop", &fixture.config, false, false)
            .await
            .expect("stop");

        let outcome = fixture
            .coordinator
            .results(
                "shop",
                &fixture.config,
                ResultsOp::Export {
                    cycle_ids: Some(vec![cycle.id]),
                    destination: None,
                },
            )
            .await
            .expect("export");
        let ResultsOutcome::Exported { path, files } = outcome else {
            panic!("expected export outcome");
        };
        assert_eq!(files, 2);

        let extracted_dir = fixture.dir.path().join("extracted");
        let extracted =
            export::extract_bundle(&path, &extracted_dir).expect("extract");
        let jtl_file = extracted
            .iter()
            .find(|p| p.extension().is_some_and(|e| e == "jtl"))
            .expect("a jtl");

        // Import the exported file twice; both imports must reproduce the
        // same rows, byte-for-byte on numeric fields.
        let mut imported_cycle_ids = Vec::new();
        for _ in 0..2 {
            let outcome = fixture
                .coordinator
                .results(
                    "shop",
                    &fixture.config,
                    ResultsOp::Import {
                        file: jtl_file.clone(),
                        plan_name: None,
                        cluster: None,
                        cycle_id: None,
                    },
                )
                .await
                .expect("import");
            let ResultsOutcome::Imported { cycle_id } = outcome else {
                panic!("expected import outcome");
            };
            assert_ne!(cycle_id, cycle.id);
            imported_cycle_ids.push(cycle_id);
        }

        let pages_of = |cycle_id: i64| {
            let clients = fixture
                .store
                .client_stats_for_cycle(cycle_id)
                .expect("clients");
            fixture
                .store
                .page_stats_for_client(clients[0].id)
                .expect("pages")
        };
        let first_import = pages_of(imported_cycle_ids[0]);
        let second_import = pages_of(imported_cycle_ids[1]);
        assert!(!first_import.is_empty());
        assert_eq!(first_import.len(), second_import.len());
        for (a, b) in first_import.iter().zip(second_import.iter()) {
            assert_eq!(a.page_label, b.page_label);
            assert_eq!(a.samples_count, b.samples_count);
            assert!((a.average_response_time - b.average_response_time).abs() < 1e-6);
            assert!((a.median_response_time - b.median_response_time).abs() < 1e-6);
            assert!(
                (a.ninety_percentile_response_time - b.ninety_percentile_response_time).abs()
                    < 1e-6
            );
            assert!((a.percentage_errors - b.percentage_errors).abs() < 1e-6);
            assert!((a.response_throughput - b.response_throughput).abs() < 1e-6);
            assert!((a.size_throughput - b.size_throughput).abs() < 1e-6);
            assert!((a.standard_deviation - b.standard_deviation).abs() < 1e-6);
            assert_eq!(a.samples_breakup_json, b.samples_breakup_json);
        }
    }

    // -----------------------------------------------------------------------
    // Remaining command surface
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn start_refuses_while_cycle_running() {
        let fixture = make_fixture(false).await;
        fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");
        let result = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await;
        assert!(matches!(
            result,
            Err(HailstormError::ExecutionCycleExists(_))
        ));
    }

    #[tokio::test]
    async fn stop_without_cycle_is_rejected() {
        let fixture = make_fixture(false).await;
        fixture
            .coordinator
            .setup("shop", &fixture.config, false)
            .await
            .expect("setup");
        let result = fixture
            .coordinator
            .stop("shop", &fixture.config, false, false)
            .await;
        assert!(matches!(
            result,
            Err(HailstormError::ExecutionCycleNotExists(_))
        ));
    }

    #[tokio::test]
    async fn status_lists_running_masters() {
        let fixture = make_fixture(false).await;
        fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");

        // Both generator pids respond to the probe.
        fixture.shell.script("kill -0 4242", "", 0);
        let live = fixture
            .coordinator
            .status("shop", &fixture.config)
            .await
            .expect("status");
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|a| a.jmeter_pid == Some(4242)));
    }

    #[tokio::test]
    async fn status_empty_without_current_cycle() {
        let fixture = make_fixture(false).await;
        fixture
            .coordinator
            .setup("shop", &fixture.config, false)
            .await
            .expect("setup");
        let live = fixture
            .coordinator
            .status("shop", &fixture.config)
            .await
            .expect("status");
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn terminate_releases_agents_and_clears_serial() {
        let fixture = make_fixture(false).await;
        fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");

        fixture
            .coordinator
            .terminate("shop", &fixture.config)
            .await
            .expect("terminate");

        let project = fixture.project();
        assert!(project.serial_version.is_none());
        assert!(fixture
            .store
            .agents_for_project(project.id)
            .expect("agents")
            .is_empty());
        let cycles = fixture.cycles();
        assert_eq!(cycles[0].status, CycleStatus::Terminated);
        // Agent instances were terminated in the cloud.
        assert_eq!(fixture.ec2.running_instance_count(), 0);
    }

    #[tokio::test]
    async fn abort_kills_generators_and_skips_stats() {
        let fixture = make_fixture(false).await;
        let cycle = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");

        fixture
            .coordinator
            .abort("shop", &fixture.config, false)
            .await
            .expect("abort");

        let cycles = fixture.cycles();
        assert_eq!(cycles[0].status, CycleStatus::Aborted);
        assert!(!fixture.shell.commands_matching("kill -9").is_empty());
        assert!(fixture
            .store
            .client_stats_for_cycle(cycle.id)
            .expect("clients")
            .is_empty());
        assert!(fixture
            .store
            .target_stats_for_cycle(cycle.id)
            .expect("targets")
            .is_empty());
    }

    #[tokio::test]
    async fn purge_tests_removes_cycles_and_staging() {
        let fixture = make_fixture(false).await;
        let cycle = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");
        fixture
            .coordinator
            .stop("shop", &fixture.config, false, false)
            .await
            .expect("stop");
        let cycle_dir = fixture.workspace.cycle_results_dir("shop", cycle.id);
        assert!(cycle_dir.is_dir());

        fixture
            .coordinator
            .purge("shop", PurgeScope::Tests)
            .await
            .expect("purge");
        assert!(fixture.cycles().is_empty());
        assert!(!cycle_dir.exists());
        // The project itself survives.
        assert!(fixture.store.find_project("shop").expect("query").is_some());
    }

    #[tokio::test]
    async fn purge_all_drops_the_project() {
        let fixture = make_fixture(false).await;
        fixture
            .coordinator
            .setup("shop", &fixture.config, false)
            .await
            .expect("setup");

        fixture
            .coordinator
            .purge("shop", PurgeScope::All)
            .await
            .expect("purge");
        assert!(fixture.store.find_project("shop").expect("query").is_none());
        assert!(!fixture.workspace.project_dir("shop").exists());
    }

    #[tokio::test]
    async fn results_show_and_exclude_include() {
        let fixture = make_fixture(false).await;
        let cycle = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");
        fixture
            .coordinator
            .stop("shop", &fixture.config, false, false)
            .await
            .expect("stop");

        fixture
            .coordinator
            .results(
                "shop",
                &fixture.config,
                ResultsOp::Exclude { cycle_id: cycle.id },
            )
            .await
            .expect("exclude");
        let outcome = fixture
            .coordinator
            .results("shop", &fixture.config, ResultsOp::Show { cycle_ids: None })
            .await
            .expect("show");
        let ResultsOutcome::Cycles(cycles) = outcome else {
            panic!("expected cycles");
        };
        assert_eq!(cycles[0].status, CycleStatus::Excluded);

        fixture
            .coordinator
            .results(
                "shop",
                &fixture.config,
                ResultsOp::Include { cycle_id: cycle.id },
            )
            .await
            .expect("include");
    }

    #[tokio::test]
    async fn results_report_flips_cycles_to_reported() {
        let fixture = make_fixture(false).await;
        let cycle = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await
            .expect("start");
        fixture
            .coordinator
            .stop("shop", &fixture.config, false, false)
            .await
            .expect("stop");

        let outcome = fixture
            .coordinator
            .results(
                "shop",
                &fixture.config,
                ResultsOp::Report { cycle_ids: None },
            )
            .await
            .expect("report");
        let ResultsOutcome::Reported { path } = outcome else {
            panic!("expected report outcome");
        };
        assert!(path.is_file());

        let reloaded = fixture
            .store
            .find_cycle(fixture.project().id, cycle.id)
            .expect("query")
            .expect("row");
        assert_eq!(reloaded.status, CycleStatus::Reported);
    }

    #[tokio::test]
    async fn commands_are_serialised_per_project() {
        let fixture = make_fixture(false).await;
        let project = fixture
            .coordinator
            .setup("shop", &fixture.config, false)
            .await
            .expect("setup");

        // Simulate another command holding the lock.
        assert!(fixture.store.try_lock_project(project.id).expect("lock"));
        let result = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await;
        assert!(matches!(result, Err(HailstormError::IncorrectCommand(_))));
        fixture.store.unlock_project(project.id).expect("unlock");
    }

    #[tokio::test]
    async fn cancelled_coordinator_aborts_load_generation() {
        let fixture = make_fixture(false).await;
        fixture.coordinator.cancel_token().cancel();

        let result = fixture
            .coordinator
            .start("shop", &fixture.config, false)
            .await;
        assert!(result.is_err());
        let cycles = fixture.cycles();
        assert_eq!(cycles[0].status, CycleStatus::Aborted);
    }
}
