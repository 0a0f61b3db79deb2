use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::HailstormError;
use crate::model::{
    AgentRole, ClientStat, ClusterKind, ClusterRow, CycleStatus, ExecutionCycle, JmeterPlan,
    LoadAgent, PageStat, Project, TargetHost, TargetStat,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY,
    project_code TEXT NOT NULL UNIQUE,
    max_threads_per_agent INTEGER NOT NULL DEFAULT 50,
    master_slave_mode INTEGER NOT NULL DEFAULT 1,
    samples_breakup_interval TEXT NOT NULL DEFAULT '1,3,5',
    serial_version TEXT
);

CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    cluster_type TEXT NOT NULL,
    slug TEXT NOT NULL,
    agent_ami TEXT,
    UNIQUE(project_id, slug)
);

CREATE TABLE IF NOT EXISTS jmeter_plans (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    test_plan_name TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    properties TEXT NOT NULL DEFAULT '{}',
    latest_threads_count INTEGER,
    UNIQUE(project_id, test_plan_name)
);

CREATE TABLE IF NOT EXISTS load_agents (
    id INTEGER PRIMARY KEY,
    clusterable_id INTEGER NOT NULL,
    clusterable_type TEXT NOT NULL,
    jmeter_plan_id INTEGER NOT NULL REFERENCES jmeter_plans(id) ON DELETE CASCADE,
    public_ip_address TEXT,
    private_ip_address TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    type TEXT NOT NULL,
    jmeter_pid INTEGER,
    identifier TEXT
);

CREATE TABLE IF NOT EXISTS target_hosts (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    host_name TEXT NOT NULL,
    role_name TEXT NOT NULL,
    type TEXT NOT NULL,
    executable_path TEXT,
    executable_pid INTEGER,
    ssh_identity TEXT,
    user_name TEXT,
    sampling_interval INTEGER NOT NULL DEFAULT 10,
    active INTEGER NOT NULL DEFAULT 0,
    UNIQUE(project_id, host_name, role_name)
);

CREATE TABLE IF NOT EXISTS execution_cycles (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'started',
    started_at TEXT NOT NULL,
    stopped_at TEXT,
    threads_count INTEGER
);

CREATE TABLE IF NOT EXISTS client_stats (
    id INTEGER PRIMARY KEY,
    execution_cycle_id INTEGER NOT NULL REFERENCES execution_cycles(id) ON DELETE CASCADE,
    jmeter_plan_id INTEGER NOT NULL,
    clusterable_id INTEGER NOT NULL,
    clusterable_type TEXT NOT NULL,
    threads_count INTEGER NOT NULL,
    aggregate_ninety_percentile REAL,
    aggregate_response_throughput REAL,
    last_sample_at TEXT
);

CREATE TABLE IF NOT EXISTS page_stats (
    id INTEGER PRIMARY KEY,
    client_stat_id INTEGER NOT NULL REFERENCES client_stats(id) ON DELETE CASCADE,
    page_label TEXT NOT NULL,
    samples_count INTEGER NOT NULL,
    average_response_time REAL NOT NULL,
    median_response_time REAL NOT NULL,
    ninety_percentile_response_time REAL NOT NULL,
    minimum_response_time REAL NOT NULL,
    maximum_response_time REAL NOT NULL,
    percentage_errors REAL NOT NULL,
    response_throughput REAL NOT NULL,
    size_throughput REAL NOT NULL,
    standard_deviation REAL NOT NULL,
    samples_breakup_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS target_stats (
    id INTEGER PRIMARY KEY,
    execution_cycle_id INTEGER NOT NULL REFERENCES execution_cycles(id) ON DELETE CASCADE,
    target_host_id INTEGER NOT NULL REFERENCES target_hosts(id) ON DELETE CASCADE,
    average_cpu_usage REAL NOT NULL,
    average_memory_usage REAL NOT NULL,
    average_swap_usage REAL,
    cpu_usage_trend TEXT,
    memory_usage_trend TEXT,
    swap_usage_trend TEXT
);

CREATE TABLE IF NOT EXISTS project_locks (
    project_id INTEGER PRIMARY KEY,
    locked_at TEXT NOT NULL
);
"#;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Embedded relational store — the single source of truth for all project
/// state. Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HailstormError> {
        let conn = Connection::open(path)?;
        Self::initialise(conn)
    }

    pub fn open_in_memory() -> Result<Self, HailstormError> {
        let conn = Connection::open_in_memory()?;
        Self::initialise(conn)
    }

    fn initialise(conn: Connection) -> Result<Self, HailstormError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub fn find_project(&self, project_code: &str) -> Result<Option<Project>, HailstormError> {
        let conn = self.conn();
        let project = conn
            .query_row(
                "SELECT id, project_code, max_threads_per_agent, master_slave_mode,
                        samples_breakup_interval, serial_version
                 FROM projects WHERE project_code = ?1",
                params![project_code],
                map_project,
            )
            .optional()?;
        Ok(project)
    }

    pub fn find_or_create_project(&self, project_code: &str) -> Result<Project, HailstormError> {
        if let Some(project) = self.find_project(project_code)? {
            return Ok(project);
        }
        {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO projects (project_code) VALUES (?1)",
                params![project_code],
            )?;
        }
        self.find_project(project_code)?.ok_or_else(|| {
            HailstormError::Store(rusqlite::Error::QueryReturnedNoRows)
        })
    }

    pub fn update_project_settings(
        &self,
        project_id: i64,
        max_threads_per_agent: u32,
        master_slave_mode: bool,
        samples_breakup_interval: &str,
    ) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE projects
             SET max_threads_per_agent = ?2, master_slave_mode = ?3,
                 samples_breakup_interval = ?4
             WHERE id = ?1",
            params![
                project_id,
                max_threads_per_agent,
                master_slave_mode as i64,
                samples_breakup_interval
            ],
        )?;
        Ok(())
    }

    pub fn set_serial_version(
        &self,
        project_id: i64,
        serial_version: Option<&str>,
    ) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE projects SET serial_version = ?2 WHERE id = ?1",
            params![project_id, serial_version],
        )?;
        Ok(())
    }

    /// Delete the project row; every owned row cascades.
    pub fn delete_project(&self, project_id: i64) -> Result<(), HailstormError> {
        self.conn()
            .execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Clusters
    // -----------------------------------------------------------------------

    pub fn find_or_create_cluster(
        &self,
        project_id: i64,
        kind: ClusterKind,
        slug: &str,
    ) -> Result<ClusterRow, HailstormError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO clusters (project_id, cluster_type, slug)
             VALUES (?1, ?2, ?3)",
            params![project_id, kind.as_str(), slug],
        )?;
        let row = conn.query_row(
            "SELECT id, project_id, cluster_type, agent_ami FROM clusters
             WHERE project_id = ?1 AND slug = ?2",
            params![project_id, slug],
            map_cluster,
        )?;
        Ok(row)
    }

    pub fn clusters_for(&self, project_id: i64) -> Result<Vec<ClusterRow>, HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, cluster_type, agent_ami FROM clusters
             WHERE project_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project_id], map_cluster)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Persist the adopted/built agent AMI for an elastic cluster.
    pub fn set_cluster_agent_ami(
        &self,
        cluster_id: i64,
        agent_ami: Option<&str>,
    ) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE clusters SET agent_ami = ?2 WHERE id = ?1",
            params![cluster_id, agent_ami],
        )?;
        Ok(())
    }

    pub fn find_cluster(&self, cluster_id: i64) -> Result<Option<ClusterRow>, HailstormError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, project_id, cluster_type, agent_ami FROM clusters WHERE id = ?1",
                params![cluster_id],
                map_cluster,
            )
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // JMeter plans
    // -----------------------------------------------------------------------

    /// Register (or refresh) a plan from the bundle; reactivates plans that
    /// were previously deactivated.
    pub fn upsert_jmeter_plan(
        &self,
        project_id: i64,
        test_plan_name: &str,
        content_hash: &str,
        properties_json: &str,
        threads_count: Option<u32>,
    ) -> Result<JmeterPlan, HailstormError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO jmeter_plans
                 (project_id, test_plan_name, content_hash, active, properties,
                  latest_threads_count)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(project_id, test_plan_name) DO UPDATE SET
                 content_hash = excluded.content_hash,
                 active = 1,
                 properties = excluded.properties,
                 latest_threads_count = excluded.latest_threads_count",
            params![project_id, test_plan_name, content_hash, properties_json, threads_count],
        )?;
        let plan = conn.query_row(
            "SELECT id, project_id, test_plan_name, content_hash, active, properties,
                    latest_threads_count
             FROM jmeter_plans WHERE project_id = ?1 AND test_plan_name = ?2",
            params![project_id, test_plan_name],
            map_plan,
        )?;
        Ok(plan)
    }

    /// Mark plans absent from the current bundle inactive, preserving them
    /// for historical cycles.
    pub fn deactivate_plans_not_in(
        &self,
        project_id: i64,
        keep_names: &[String],
    ) -> Result<(), HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, test_plan_name FROM jmeter_plans WHERE project_id = ?1 AND active = 1",
        )?;
        let existing = stmt
            .query_map(params![project_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, name) in existing {
            if !keep_names.iter().any(|k| k == &name) {
                conn.execute(
                    "UPDATE jmeter_plans SET active = 0 WHERE id = ?1",
                    params![id],
                )?;
            }
        }
        Ok(())
    }

    pub fn active_plans(&self, project_id: i64) -> Result<Vec<JmeterPlan>, HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, test_plan_name, content_hash, active, properties,
                    latest_threads_count
             FROM jmeter_plans WHERE project_id = ?1 AND active = 1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project_id], map_plan)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find_plan(&self, plan_id: i64) -> Result<Option<JmeterPlan>, HailstormError> {
        let conn = self.conn();
        let plan = conn
            .query_row(
                "SELECT id, project_id, test_plan_name, content_hash, active, properties,
                        latest_threads_count
                 FROM jmeter_plans WHERE id = ?1",
                params![plan_id],
                map_plan,
            )
            .optional()?;
        Ok(plan)
    }

    pub fn plan_by_name(
        &self,
        project_id: i64,
        test_plan_name: &str,
    ) -> Result<Option<JmeterPlan>, HailstormError> {
        let conn = self.conn();
        let plan = conn
            .query_row(
                "SELECT id, project_id, test_plan_name, content_hash, active, properties,
                        latest_threads_count
                 FROM jmeter_plans WHERE project_id = ?1 AND test_plan_name = ?2",
                params![project_id, test_plan_name],
                map_plan,
            )
            .optional()?;
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Load agents
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_load_agent(
        &self,
        clusterable_id: i64,
        clusterable_kind: ClusterKind,
        jmeter_plan_id: i64,
        role: AgentRole,
        identifier: Option<&str>,
        public_ip: Option<&str>,
        private_ip: Option<&str>,
    ) -> Result<LoadAgent, HailstormError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO load_agents
                 (clusterable_id, clusterable_type, jmeter_plan_id, public_ip_address,
                  private_ip_address, active, type, jmeter_pid, identifier)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, NULL, ?7)",
            params![
                clusterable_id,
                clusterable_kind.as_str(),
                jmeter_plan_id,
                public_ip,
                private_ip,
                role.as_str(),
                identifier
            ],
        )?;
        let id = conn.last_insert_rowid();
        let agent = conn.query_row(
            &format!("{AGENT_SELECT} WHERE id = ?1"),
            params![id],
            map_agent,
        )?;
        Ok(agent)
    }

    pub fn agents_for_plan(
        &self,
        clusterable_id: i64,
        clusterable_kind: ClusterKind,
        jmeter_plan_id: i64,
    ) -> Result<Vec<LoadAgent>, HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{AGENT_SELECT}
             WHERE clusterable_id = ?1 AND clusterable_type = ?2 AND jmeter_plan_id = ?3
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(
                params![clusterable_id, clusterable_kind.as_str(), jmeter_plan_id],
                map_agent,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All agents whose plan belongs to the project.
    pub fn agents_for_project(&self, project_id: i64) -> Result<Vec<LoadAgent>, HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{AGENT_SELECT}
             WHERE jmeter_plan_id IN (SELECT id FROM jmeter_plans WHERE project_id = ?1)
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![project_id], map_agent)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_agent_active(&self, agent_id: i64, active: bool) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE load_agents SET active = ?2 WHERE id = ?1",
            params![agent_id, active as i64],
        )?;
        Ok(())
    }

    pub fn update_agent_role(&self, agent_id: i64, role: AgentRole) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE load_agents SET type = ?2 WHERE id = ?1",
            params![agent_id, role.as_str()],
        )?;
        Ok(())
    }

    pub fn update_agent_addresses(
        &self,
        agent_id: i64,
        public_ip: Option<&str>,
        private_ip: Option<&str>,
    ) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE load_agents SET public_ip_address = ?2, private_ip_address = ?3
             WHERE id = ?1",
            params![agent_id, public_ip, private_ip],
        )?;
        Ok(())
    }

    pub fn update_agent_pid(
        &self,
        agent_id: i64,
        jmeter_pid: Option<u32>,
    ) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE load_agents SET jmeter_pid = ?2 WHERE id = ?1",
            params![agent_id, jmeter_pid],
        )?;
        Ok(())
    }

    pub fn delete_agent(&self, agent_id: i64) -> Result<(), HailstormError> {
        self.conn()
            .execute("DELETE FROM load_agents WHERE id = ?1", params![agent_id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Target hosts
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_target_host(
        &self,
        project_id: i64,
        host_name: &str,
        role_name: &str,
        monitor_kind: &str,
        executable_path: Option<&str>,
        ssh_identity: Option<&str>,
        user_name: Option<&str>,
        sampling_interval_secs: u32,
    ) -> Result<TargetHost, HailstormError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO target_hosts
                 (project_id, host_name, role_name, type, executable_path, ssh_identity,
                  user_name, sampling_interval, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
             ON CONFLICT(project_id, host_name, role_name) DO UPDATE SET
                 type = excluded.type,
                 executable_path = excluded.executable_path,
                 ssh_identity = excluded.ssh_identity,
                 user_name = excluded.user_name,
                 sampling_interval = excluded.sampling_interval,
                 active = 1",
            params![
                project_id,
                host_name,
                role_name,
                monitor_kind,
                executable_path,
                ssh_identity,
                user_name,
                sampling_interval_secs
            ],
        )?;
        let host = conn.query_row(
            &format!("{TARGET_SELECT} WHERE project_id = ?1 AND host_name = ?2 AND role_name = ?3"),
            params![project_id, host_name, role_name],
            map_target,
        )?;
        Ok(host)
    }

    pub fn deactivate_targets_not_in(
        &self,
        project_id: i64,
        keep: &[(String, String)],
    ) -> Result<(), HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, host_name, role_name FROM target_hosts
             WHERE project_id = ?1 AND active = 1",
        )?;
        let existing = stmt
            .query_map(params![project_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, host, role) in existing {
            if !keep.iter().any(|(h, r)| h == &host && r == &role) {
                conn.execute(
                    "UPDATE target_hosts SET active = 0 WHERE id = ?1",
                    params![id],
                )?;
            }
        }
        Ok(())
    }

    pub fn active_target_hosts(&self, project_id: i64) -> Result<Vec<TargetHost>, HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{TARGET_SELECT} WHERE project_id = ?1 AND active = 1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![project_id], map_target)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_target_pid(
        &self,
        target_host_id: i64,
        pid: Option<u32>,
    ) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE target_hosts SET executable_pid = ?2 WHERE id = ?1",
            params![target_host_id, pid],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution cycles
    // -----------------------------------------------------------------------

    /// The unique `started` cycle, when one exists.
    pub fn current_cycle(&self, project_id: i64) -> Result<Option<ExecutionCycle>, HailstormError> {
        let conn = self.conn();
        let cycle = conn
            .query_row(
                &format!("{CYCLE_SELECT} WHERE project_id = ?1 AND status = 'started'"),
                params![project_id],
                map_cycle,
            )
            .optional()?;
        Ok(cycle)
    }

    pub fn create_cycle(
        &self,
        project_id: i64,
        started_at: DateTime<Utc>,
        threads_count: Option<u32>,
    ) -> Result<ExecutionCycle, HailstormError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO execution_cycles (project_id, status, started_at, threads_count)
             VALUES (?1, 'started', ?2, ?3)",
            params![project_id, format_ts(started_at), threads_count],
        )?;
        let id = conn.last_insert_rowid();
        let cycle = conn.query_row(
            &format!("{CYCLE_SELECT} WHERE id = ?1"),
            params![id],
            map_cycle,
        )?;
        Ok(cycle)
    }

    pub fn update_cycle_status(
        &self,
        cycle_id: i64,
        status: CycleStatus,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Result<(), HailstormError> {
        match stopped_at {
            Some(ts) => {
                self.conn().execute(
                    "UPDATE execution_cycles SET status = ?2, stopped_at = ?3 WHERE id = ?1",
                    params![cycle_id, status.as_str(), format_ts(ts)],
                )?;
            }
            None => {
                self.conn().execute(
                    "UPDATE execution_cycles SET status = ?2 WHERE id = ?1",
                    params![cycle_id, status.as_str()],
                )?;
            }
        }
        Ok(())
    }

    pub fn set_cycle_threads(&self, cycle_id: i64, threads: u32) -> Result<(), HailstormError> {
        self.conn().execute(
            "UPDATE execution_cycles SET threads_count = ?2 WHERE id = ?1",
            params![cycle_id, threads],
        )?;
        Ok(())
    }

    pub fn find_cycle(
        &self,
        project_id: i64,
        cycle_id: i64,
    ) -> Result<Option<ExecutionCycle>, HailstormError> {
        let conn = self.conn();
        let cycle = conn
            .query_row(
                &format!("{CYCLE_SELECT} WHERE project_id = ?1 AND id = ?2"),
                params![project_id, cycle_id],
                map_cycle,
            )
            .optional()?;
        Ok(cycle)
    }

    /// Cycles of the project, optionally restricted to the given ids.
    pub fn cycles(
        &self,
        project_id: i64,
        ids: Option<&[i64]>,
    ) -> Result<Vec<ExecutionCycle>, HailstormError> {
        let all = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "{CYCLE_SELECT} WHERE project_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![project_id], map_cycle)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        Ok(match ids {
            Some(ids) => all.into_iter().filter(|c| ids.contains(&c.id)).collect(),
            None => all,
        })
    }

    pub fn delete_cycles_for_project(&self, project_id: i64) -> Result<Vec<i64>, HailstormError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id FROM execution_cycles WHERE project_id = ?1")?;
        let ids = stmt
            .query_map(params![project_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        conn.execute(
            "DELETE FROM execution_cycles WHERE project_id = ?1",
            params![project_id],
        )?;
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_client_stat(
        &self,
        execution_cycle_id: i64,
        jmeter_plan_id: i64,
        clusterable_id: i64,
        clusterable_kind: ClusterKind,
        threads_count: u32,
        aggregate_ninety_percentile: f64,
        aggregate_response_throughput: f64,
        last_sample_at: Option<DateTime<Utc>>,
    ) -> Result<i64, HailstormError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO client_stats
                 (execution_cycle_id, jmeter_plan_id, clusterable_id, clusterable_type,
                  threads_count, aggregate_ninety_percentile, aggregate_response_throughput,
                  last_sample_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                execution_cycle_id,
                jmeter_plan_id,
                clusterable_id,
                clusterable_kind.as_str(),
                threads_count,
                aggregate_ninety_percentile,
                aggregate_response_throughput,
                last_sample_at.map(format_ts)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_page_stat(&self, stat: &PageStat) -> Result<i64, HailstormError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO page_stats
                 (client_stat_id, page_label, samples_count, average_response_time,
                  median_response_time, ninety_percentile_response_time,
                  minimum_response_time, maximum_response_time, percentage_errors,
                  response_throughput, size_throughput, standard_deviation,
                  samples_breakup_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                stat.client_stat_id,
                stat.page_label,
                stat.samples_count as i64,
                stat.average_response_time,
                stat.median_response_time,
                stat.ninety_percentile_response_time,
                stat.minimum_response_time,
                stat.maximum_response_time,
                stat.percentage_errors,
                stat.response_throughput,
                stat.size_throughput,
                stat.standard_deviation,
                stat.samples_breakup_json
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_target_stat(&self, stat: &TargetStat) -> Result<i64, HailstormError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO target_stats
                 (execution_cycle_id, target_host_id, average_cpu_usage,
                  average_memory_usage, average_swap_usage, cpu_usage_trend,
                  memory_usage_trend, swap_usage_trend)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                stat.execution_cycle_id,
                stat.target_host_id,
                stat.average_cpu_usage,
                stat.average_memory_usage,
                stat.average_swap_usage,
                stat.cpu_usage_trend,
                stat.memory_usage_trend,
                stat.swap_usage_trend
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn client_stats_for_cycle(
        &self,
        execution_cycle_id: i64,
    ) -> Result<Vec<ClientStat>, HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, execution_cycle_id, jmeter_plan_id, clusterable_id, clusterable_type,
                    threads_count, aggregate_ninety_percentile, aggregate_response_throughput,
                    last_sample_at
             FROM client_stats WHERE execution_cycle_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![execution_cycle_id], map_client_stat)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn page_stats_for_client(
        &self,
        client_stat_id: i64,
    ) -> Result<Vec<PageStat>, HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, client_stat_id, page_label, samples_count, average_response_time,
                    median_response_time, ninety_percentile_response_time,
                    minimum_response_time, maximum_response_time, percentage_errors,
                    response_throughput, size_throughput, standard_deviation,
                    samples_breakup_json
             FROM page_stats WHERE client_stat_id = ?1 ORDER BY page_label",
        )?;
        let rows = stmt
            .query_map(params![client_stat_id], map_page_stat)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn target_stats_for_cycle(
        &self,
        execution_cycle_id: i64,
    ) -> Result<Vec<TargetStat>, HailstormError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, execution_cycle_id, target_host_id, average_cpu_usage,
                    average_memory_usage, average_swap_usage, cpu_usage_trend,
                    memory_usage_trend, swap_usage_trend
             FROM target_stats WHERE execution_cycle_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![execution_cycle_id], map_target_stat)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Advisory project lock
    // -----------------------------------------------------------------------

    /// Take the per-project command lock. Returns `false` when another
    /// command holds it.
    pub fn try_lock_project(&self, project_id: i64) -> Result<bool, HailstormError> {
        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO project_locks (project_id, locked_at) VALUES (?1, ?2)",
            params![project_id, format_ts(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    pub fn unlock_project(&self, project_id: i64) -> Result<(), HailstormError> {
        self.conn().execute(
            "DELETE FROM project_locks WHERE project_id = ?1",
            params![project_id],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const AGENT_SELECT: &str = "SELECT id, clusterable_id, clusterable_type, jmeter_plan_id,
        public_ip_address, private_ip_address, active, type, jmeter_pid, identifier
 FROM load_agents";

const TARGET_SELECT: &str = "SELECT id, project_id, host_name, role_name, type, executable_path,
        executable_pid, ssh_identity, user_name, sampling_interval, active
 FROM target_hosts";

const CYCLE_SELECT: &str =
    "SELECT id, project_id, status, started_at, stopped_at, threads_count FROM execution_cycles";

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_enum<T>(raw: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unrecognised enum value '{raw}'").into(),
        )
    })
}

fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        project_code: row.get(1)?,
        max_threads_per_agent: row.get(2)?,
        master_slave_mode: row.get::<_, i64>(3)? != 0,
        samples_breakup_interval: row.get(4)?,
        serial_version: row.get(5)?,
    })
}

fn map_cluster(row: &Row<'_>) -> rusqlite::Result<ClusterRow> {
    Ok(ClusterRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        kind: parse_enum(row.get(2)?, ClusterKind::parse)?,
        agent_ami: row.get(3)?,
    })
}

fn map_plan(row: &Row<'_>) -> rusqlite::Result<JmeterPlan> {
    Ok(JmeterPlan {
        id: row.get(0)?,
        project_id: row.get(1)?,
        test_plan_name: row.get(2)?,
        content_hash: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        properties: row.get(5)?,
        latest_threads_count: row.get(6)?,
    })
}

fn map_agent(row: &Row<'_>) -> rusqlite::Result<LoadAgent> {
    Ok(LoadAgent {
        id: row.get(0)?,
        clusterable_id: row.get(1)?,
        clusterable_kind: parse_enum(row.get(2)?, ClusterKind::parse)?,
        jmeter_plan_id: row.get(3)?,
        public_ip_address: row.get(4)?,
        private_ip_address: row.get(5)?,
        active: row.get::<_, i64>(6)? != 0,
        role: parse_enum(row.get(7)?, AgentRole::parse)?,
        jmeter_pid: row.get(8)?,
        identifier: row.get(9)?,
    })
}

fn map_target(row: &Row<'_>) -> rusqlite::Result<TargetHost> {
    Ok(TargetHost {
        id: row.get(0)?,
        project_id: row.get(1)?,
        host_name: row.get(2)?,
        role_name: row.get(3)?,
        monitor_kind: row.get(4)?,
        executable_path: row.get(5)?,
        executable_pid: row.get(6)?,
        ssh_identity: row.get(7)?,
        user_name: row.get(8)?,
        sampling_interval_secs: row.get(9)?,
        active: row.get::<_, i64>(10)? != 0,
    })
}

fn map_cycle(row: &Row<'_>) -> rusqlite::Result<ExecutionCycle> {
    Ok(ExecutionCycle {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status: parse_enum(row.get(2)?, CycleStatus::parse)?,
        started_at: parse_ts(row.get(3)?)?,
        stopped_at: row.get::<_, Option<String>>(4)?.map(parse_ts).transpose()?,
        threads_count: row.get(5)?,
    })
}

fn map_client_stat(row: &Row<'_>) -> rusqlite::Result<ClientStat> {
    Ok(ClientStat {
        id: row.get(0)?,
        execution_cycle_id: row.get(1)?,
        jmeter_plan_id: row.get(2)?,
        clusterable_id: row.get(3)?,
        clusterable_kind: parse_enum(row.get(4)?, ClusterKind::parse)?,
        threads_count: row.get(5)?,
        aggregate_ninety_percentile: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
        aggregate_response_throughput: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
        last_sample_at: row.get::<_, Option<String>>(8)?.map(parse_ts).transpose()?,
    })
}

fn map_page_stat(row: &Row<'_>) -> rusqlite::Result<PageStat> {
    Ok(PageStat {
        id: row.get(0)?,
        client_stat_id: row.get(1)?,
        page_label: row.get(2)?,
        samples_count: row.get::<_, i64>(3)? as u64,
        average_response_time: row.get(4)?,
        median_response_time: row.get(5)?,
        ninety_percentile_response_time: row.get(6)?,
        minimum_response_time: row.get(7)?,
        maximum_response_time: row.get(8)?,
        percentage_errors: row.get(9)?,
        response_throughput: row.get(10)?,
        size_throughput: row.get(11)?,
        standard_deviation: row.get(12)?,
        samples_breakup_json: row.get(13)?,
    })
}

fn map_target_stat(row: &Row<'_>) -> rusqlite::Result<TargetStat> {
    Ok(TargetStat {
        id: row.get(0)?,
        execution_cycle_id: row.get(1)?,
        target_host_id: row.get(2)?,
        average_cpu_usage: row.get(3)?,
        average_memory_usage: row.get(4)?,
        average_swap_usage: row.get(5)?,
        cpu_usage_trend: row.get(6)?,
        memory_usage_trend: row.get(7)?,
        swap_usage_trend: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
