use chrono::Utc;
use tracing::info;

use crate::error::HailstormError;
use crate::model::{CycleStatus, ExecutionCycle, Project};
use crate::store::Store;

/// Owns the per-cycle state machine (C6):
///
/// ```text
/// (no cycle) ── start ─► STARTED ── stop ──────► STOPPED ─► report: REPORTED
///                          │                        │
///                          ├─ abort ──► ABORTED     ├─ exclude ► EXCLUDED
///                          └─ terminate ► TERMINATED└─ include ◄ (back to STOPPED)
/// ```
///
/// Terminal states are never revoked implicitly; only the explicit
/// `exclude ↔ include` toggle moves a cycle back.
#[derive(Clone)]
pub struct CycleController {
    store: Store,
}

impl CycleController {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn current(&self, project: &Project) -> Result<Option<ExecutionCycle>, HailstormError> {
        self.store.current_cycle(project.id)
    }

    /// Open a new cycle. At most one `started` cycle may exist per project.
    pub fn begin(
        &self,
        project: &Project,
        threads_count: Option<u32>,
    ) -> Result<ExecutionCycle, HailstormError> {
        if self.store.current_cycle(project.id)?.is_some() {
            return Err(HailstormError::ExecutionCycleExists(
                project.project_code.clone(),
            ));
        }
        let cycle = self.store.create_cycle(project.id, Utc::now(), threads_count)?;
        info!(cycle = cycle.id, project = %project.project_code, "cycle started");
        Ok(cycle)
    }

    /// The `started` cycle, or the error lifecycle commands raise without one.
    pub fn require_current(&self, project: &Project) -> Result<ExecutionCycle, HailstormError> {
        self.store.current_cycle(project.id)?.ok_or_else(|| {
            HailstormError::ExecutionCycleNotExists(project.project_code.clone())
        })
    }

    pub fn mark_stopped(&self, cycle: &ExecutionCycle) -> Result<(), HailstormError> {
        self.store
            .update_cycle_status(cycle.id, CycleStatus::Stopped, Some(Utc::now()))?;
        info!(cycle = cycle.id, "cycle stopped");
        Ok(())
    }

    pub fn mark_aborted(&self, cycle: &ExecutionCycle) -> Result<(), HailstormError> {
        self.store
            .update_cycle_status(cycle.id, CycleStatus::Aborted, Some(Utc::now()))?;
        info!(cycle = cycle.id, "cycle aborted");
        Ok(())
    }

    pub fn mark_terminated(&self, cycle: &ExecutionCycle) -> Result<(), HailstormError> {
        self.store
            .update_cycle_status(cycle.id, CycleStatus::Terminated, Some(Utc::now()))?;
        info!(cycle = cycle.id, "cycle terminated");
        Ok(())
    }

    /// `stopped → excluded`; anything else is rejected.
    pub fn exclude(&self, project: &Project, cycle_id: i64) -> Result<(), HailstormError> {
        let cycle = self.find(project, cycle_id)?;
        if cycle.status != CycleStatus::Stopped {
            return Err(HailstormError::IncorrectCommand(format!(
                "cycle {cycle_id} is {}, only stopped cycles can be excluded",
                cycle.status
            )));
        }
        self.store
            .update_cycle_status(cycle.id, CycleStatus::Excluded, None)
    }

    /// `excluded → stopped`; anything else is rejected.
    pub fn include(&self, project: &Project, cycle_id: i64) -> Result<(), HailstormError> {
        let cycle = self.find(project, cycle_id)?;
        if cycle.status != CycleStatus::Excluded {
            return Err(HailstormError::IncorrectCommand(format!(
                "cycle {cycle_id} is {}, only excluded cycles can be included",
                cycle.status
            )));
        }
        self.store
            .update_cycle_status(cycle.id, CycleStatus::Stopped, None)
    }

    /// Flip freshly reported cycles `stopped → reported`. Cycles already
    /// `reported` stay as they are.
    pub fn mark_reported(&self, cycles: &[ExecutionCycle]) -> Result<(), HailstormError> {
        for cycle in cycles {
            if cycle.status == CycleStatus::Stopped {
                self.store
                    .update_cycle_status(cycle.id, CycleStatus::Reported, None)?;
            }
        }
        Ok(())
    }

    /// Cycles eligible for a report, optionally restricted to `ids`.
    pub fn reportable(
        &self,
        project: &Project,
        ids: Option<&[i64]>,
    ) -> Result<Vec<ExecutionCycle>, HailstormError> {
        Ok(self
            .store
            .cycles(project.id, ids)?
            .into_iter()
            .filter(ExecutionCycle::is_reportable)
            .collect())
    }

    fn find(&self, project: &Project, cycle_id: i64) -> Result<ExecutionCycle, HailstormError> {
        self.store.find_cycle(project.id, cycle_id)?.ok_or_else(|| {
            HailstormError::IncorrectCommand(format!(
                "no execution cycle {cycle_id} in project '{}'",
                project.project_code
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
