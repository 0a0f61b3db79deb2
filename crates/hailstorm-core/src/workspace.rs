use std::path::{Path, PathBuf};

use crate::error::HailstormError;

/// Sub-directories created under every project root.
const PROJECT_DIRS: [&str; 8] = [
    "db", "app", "log", "tmp", "reports", "config", "vendor", "script",
];

/// Filesystem layout for project artefacts.
///
/// Each project lives under `<root>/<project_code>/` with the fixed
/// sub-directory set; per-cycle result files are staged under
/// `tmp/SEQUENCE-<cycle_id>/`.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project_code: &str) -> PathBuf {
        self.root.join(project_code)
    }

    /// Directory holding the uploaded test-plan bundle (plans + data files).
    pub fn app_dir(&self, project_code: &str) -> PathBuf {
        self.project_dir(project_code).join("app")
    }

    pub fn db_dir(&self, project_code: &str) -> PathBuf {
        self.project_dir(project_code).join("db")
    }

    pub fn log_dir(&self, project_code: &str) -> PathBuf {
        self.project_dir(project_code).join("log")
    }

    pub fn reports_dir(&self, project_code: &str) -> PathBuf {
        self.project_dir(project_code).join("reports")
    }

    pub fn config_dir(&self, project_code: &str) -> PathBuf {
        self.project_dir(project_code).join("config")
    }

    pub fn tmp_dir(&self, project_code: &str) -> PathBuf {
        self.project_dir(project_code).join("tmp")
    }

    /// Staging directory for one cycle's collected result files.
    pub fn cycle_results_dir(&self, project_code: &str, cycle_id: i64) -> PathBuf {
        self.tmp_dir(project_code).join(format!("SEQUENCE-{cycle_id}"))
    }

    /// Local path for one agent's collected JTL inside a cycle directory.
    pub fn agent_jtl_path(&self, project_code: &str, cycle_id: i64, agent_slug: &str) -> PathBuf {
        self.cycle_results_dir(project_code, cycle_id)
            .join(format!("{agent_slug}.jtl"))
    }

    /// Create the project directory tree. Safe to call repeatedly.
    pub async fn ensure_project_dirs(&self, project_code: &str) -> Result<(), HailstormError> {
        let base = self.project_dir(project_code);
        for dir in PROJECT_DIRS {
            tokio::fs::create_dir_all(base.join(dir)).await?;
        }
        Ok(())
    }

    /// Create (or reuse) the staging directory for a cycle.
    pub async fn ensure_cycle_dir(
        &self,
        project_code: &str,
        cycle_id: i64,
    ) -> Result<PathBuf, HailstormError> {
        let dir = self.cycle_results_dir(project_code, cycle_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove everything under the project root.
    pub async fn purge_project(&self, project_code: &str) -> Result<(), HailstormError> {
        let dir = self.project_dir(project_code);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Remove the staged results of the given cycles.
    pub async fn purge_cycle_dirs(
        &self,
        project_code: &str,
        cycle_ids: &[i64],
    ) -> Result<(), HailstormError> {
        for id in cycle_ids {
            let dir = self.cycle_results_dir(project_code, *id);
            if tokio::fs::try_exists(&dir).await? {
                tokio::fs::remove_dir_all(&dir).await?;
            }
        }
        Ok(())
    }
}

/// File-name-safe slug for an agent, derived from its identifier or address.
pub fn agent_slug(identifier: Option<&str>, public_ip: Option<&str>, agent_id: i64) -> String {
    let base = identifier
        .or(public_ip)
        .map(str::to_string)
        .unwrap_or_else(|| format!("agent-{agent_id}"));
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
