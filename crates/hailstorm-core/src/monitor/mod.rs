use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::HailstormError;
use crate::model::{ExecutionCycle, TargetHost, TargetStat};
use crate::remote::{HostSpec, RemoteExecutor};
use crate::store::Store;

// ---------------------------------------------------------------------------
// MonitorTrends
// ---------------------------------------------------------------------------

/// Sampled time series pulled from one target host.
#[derive(Debug, Clone, Default)]
pub struct MonitorTrends {
    pub cpu: Vec<f64>,
    pub memory: Vec<f64>,
    pub swap: Vec<f64>,
}

impl MonitorTrends {
    /// Parse `cpu,memory,swap` CSV lines; the swap column is optional.
    pub fn parse_csv(content: &str) -> Self {
        let mut trends = Self::default();
        for line in content.lines() {
            let mut fields = line.split(',').map(str::trim);
            let (Some(cpu), Some(memory)) = (fields.next(), fields.next()) else {
                continue;
            };
            let (Ok(cpu), Ok(memory)) = (cpu.parse::<f64>(), memory.parse::<f64>()) else {
                continue;
            };
            trends.cpu.push(cpu);
            trends.memory.push(memory);
            if let Some(Ok(swap)) = fields.next().map(str::parse::<f64>) {
                trends.swap.push(swap);
            }
        }
        trends
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty()
    }

    /// `(avg cpu, avg memory, avg swap)`; swap is `None` when never sampled.
    pub fn averages(&self) -> (f64, f64, Option<f64>) {
        (
            mean(&self.cpu),
            mean(&self.memory),
            if self.swap.is_empty() {
                None
            } else {
                Some(mean(&self.swap))
            },
        )
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

// ---------------------------------------------------------------------------
// MonitorBackend — uniform interface over monitor implementations
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MonitorBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Verify (or set up) the sampler tooling on the host.
    async fn install(&self, target: &TargetHost) -> Result<(), HailstormError>;

    /// Start the sampler loop; returns its pid.
    async fn start(&self, target: &TargetHost) -> Result<u32, HailstormError>;

    /// Stop the sampler.
    async fn stop(&self, target: &TargetHost, pid: u32) -> Result<(), HailstormError>;

    /// Download and parse the sampled trend file.
    async fn fetch_trends(
        &self,
        target: &TargetHost,
        staging_dir: &Path,
    ) -> Result<MonitorTrends, HailstormError>;

    /// Remove sampler artefacts from the host.
    async fn terminate(&self, target: &TargetHost, pid: Option<u32>)
        -> Result<(), HailstormError>;
}

/// Resolve a monitor backend by its discriminator.
pub fn monitor_backend_for(
    kind: &str,
    executor: RemoteExecutor,
) -> Result<Arc<dyn MonitorBackend>, HailstormError> {
    match kind {
        "vmstat" => Ok(Arc::new(VmstatMonitor::new(executor))),
        other => Err(HailstormError::Configuration(format!(
            "unknown monitor type '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// VmstatMonitor
// ---------------------------------------------------------------------------

/// Monitor built from stock `vmstat`/`free`: a background shell loop appends
/// one `cpu,memory,swap` line per sampling interval to a trend file.
pub struct VmstatMonitor {
    executor: RemoteExecutor,
}

impl VmstatMonitor {
    pub fn new(executor: RemoteExecutor) -> Self {
        Self { executor }
    }

    fn host_spec(target: &TargetHost) -> Result<HostSpec, HailstormError> {
        let identity = target.ssh_identity.as_deref().ok_or_else(|| {
            HailstormError::Configuration(format!(
                "target host '{}' has no ssh_identity",
                target.host_name
            ))
        })?;
        Ok(HostSpec::new(
            target.host_name.clone(),
            22,
            target.user_name.clone().unwrap_or_else(|| "root".to_string()),
            identity,
        ))
    }

    fn trend_file(target: &TargetHost) -> String {
        format!("/tmp/hailstorm-monitor-{}.csv", target.role_name)
    }

    fn sampler_command(target: &TargetHost) -> String {
        let file = Self::trend_file(target);
        let interval = target.sampling_interval_secs.max(1);
        format!(
            "rm -f {file} && nohup sh -c 'while true; do \
             cpu=$(vmstat 1 2 | tail -1 | awk \"{{print 100 - \\$15}}\"); \
             mem=$(free | awk \"/Mem:/ {{printf \\\"%.1f\\\", \\$3 / \\$2 * 100}}\"); \
             swap=$(free | awk \"/Swap:/ {{if (\\$2 > 0) printf \\\"%.1f\\\", \\$3 / \\$2 * 100; else print 0}}\"); \
             echo \"$cpu,$mem,$swap\" >> {file}; \
             sleep {interval}; done' > /dev/null 2>&1 & echo $!"
        )
    }
}

#[async_trait]
impl MonitorBackend for VmstatMonitor {
    fn kind(&self) -> &'static str {
        "vmstat"
    }

    async fn install(&self, target: &TargetHost) -> Result<(), HailstormError> {
        let host = Self::host_spec(target)?;
        let out = self
            .executor
            .exec(&host, "command -v vmstat && command -v free")
            .await?;
        if !out.success() {
            return Err(HailstormError::Setup(format!(
                "vmstat/free not available on '{}'",
                target.host_name
            )));
        }
        Ok(())
    }

    async fn start(&self, target: &TargetHost) -> Result<u32, HailstormError> {
        let host = Self::host_spec(target)?;
        let out = self
            .executor
            .exec_checked(&host, &Self::sampler_command(target))
            .await?;
        out.stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| {
                HailstormError::Setup(format!(
                    "could not read sampler pid on '{}'",
                    target.host_name
                ))
            })
    }

    async fn stop(&self, target: &TargetHost, pid: u32) -> Result<(), HailstormError> {
        let host = Self::host_spec(target)?;
        // The sampler may have died already; ignore the exit code.
        let _ = self.executor.exec(&host, &format!("kill {pid}")).await?;
        Ok(())
    }

    async fn fetch_trends(
        &self,
        target: &TargetHost,
        staging_dir: &Path,
    ) -> Result<MonitorTrends, HailstormError> {
        let host = Self::host_spec(target)?;
        let local = staging_dir.join(format!(
            "{}-{}-trend.csv",
            crate::model::slugify_project_code(&target.host_name),
            target.role_name
        ));
        self.executor
            .download(&host, &Self::trend_file(target), &local)
            .await?;
        let content = tokio::fs::read_to_string(&local).await?;
        Ok(MonitorTrends::parse_csv(&content))
    }

    async fn terminate(
        &self,
        target: &TargetHost,
        pid: Option<u32>,
    ) -> Result<(), HailstormError> {
        let host = Self::host_spec(target)?;
        if let Some(pid) = pid {
            let _ = self.executor.exec(&host, &format!("kill {pid}")).await?;
        }
        let _ = self
            .executor
            .exec(&host, &format!("rm -f {}", Self::trend_file(target)))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MonitorManager
// ---------------------------------------------------------------------------

/// Coordinates monitors across all of a project's active target hosts (C5).
#[derive(Clone)]
pub struct MonitorManager {
    store: Store,
    executor: RemoteExecutor,
}

impl MonitorManager {
    pub fn new(store: Store, executor: RemoteExecutor) -> Self {
        Self { store, executor }
    }

    fn backend_for(&self, target: &TargetHost) -> Result<Arc<dyn MonitorBackend>, HailstormError> {
        monitor_backend_for(&target.monitor_kind, self.executor.clone())
    }

    /// Verify sampler tooling on every active target.
    pub async fn install_all(&self, project_id: i64) -> Result<(), HailstormError> {
        for target in self.store.active_target_hosts(project_id)? {
            self.backend_for(&target)?.install(&target).await?;
        }
        Ok(())
    }

    /// Start sampling on every active target, recording pids.
    pub async fn start_all(&self, project_id: i64) -> Result<(), HailstormError> {
        for target in self.store.active_target_hosts(project_id)? {
            let pid = self.backend_for(&target)?.start(&target).await?;
            self.store.update_target_pid(target.id, Some(pid))?;
            info!(target = %target.host_name, pid, "started monitor");
        }
        Ok(())
    }

    /// Stop sampling everywhere. Every target is attempted even when some
    /// fail; with `create_target_stat` the trends are summarised into
    /// [`TargetStat`] rows for `cycle`. Passing `create_target_stat = false`
    /// (after a failed load stop) discards the biased samples.
    pub async fn stop_all(
        &self,
        project_id: i64,
        cycle: Option<&ExecutionCycle>,
        staging_dir: &Path,
        create_target_stat: bool,
    ) -> Result<(), HailstormError> {
        let mut first_error = None;
        for target in self.store.active_target_hosts(project_id)? {
            let result = self
                .stop_one(&target, cycle, staging_dir, create_target_stat)
                .await;
            if let Err(err) = result {
                warn!(target = %target.host_name, %err, "monitor stop failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stop_one(
        &self,
        target: &TargetHost,
        cycle: Option<&ExecutionCycle>,
        staging_dir: &Path,
        create_target_stat: bool,
    ) -> Result<(), HailstormError> {
        let backend = self.backend_for(target)?;
        if let Some(pid) = target.executable_pid {
            backend.stop(target, pid).await?;
        }
        self.store.update_target_pid(target.id, None)?;

        if create_target_stat {
            if let Some(cycle) = cycle {
                let trends = backend.fetch_trends(target, staging_dir).await?;
                if !trends.is_empty() {
                    let (cpu, memory, swap) = trends.averages();
                    self.store.insert_target_stat(&TargetStat {
                        id: 0,
                        execution_cycle_id: cycle.id,
                        target_host_id: target.id,
                        average_cpu_usage: cpu,
                        average_memory_usage: memory,
                        average_swap_usage: swap,
                        cpu_usage_trend: Some(serde_json::to_string(&trends.cpu)?),
                        memory_usage_trend: Some(serde_json::to_string(&trends.memory)?),
                        swap_usage_trend: Some(serde_json::to_string(&trends.swap)?),
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Remove sampler artefacts from every active target.
    pub async fn terminate_all(&self, project_id: i64) -> Result<(), HailstormError> {
        for target in self.store.active_target_hosts(project_id)? {
            let backend = self.backend_for(&target)?;
            backend.terminate(&target, target.executable_pid).await?;
            self.store.update_target_pid(target.id, None)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
