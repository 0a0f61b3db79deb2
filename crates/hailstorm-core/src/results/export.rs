use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::HailstormError;
use crate::model::{ClusterKind, CycleStatus, ExecutionCycle, JmeterPlan, Project};
use crate::results::{ingest_samples, jtl};
use crate::store::Store;
use crate::workspace::Workspace;

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Bundle the staged result files of the given cycles into a zip whose
/// entries keep the `SEQUENCE-<id>/<file>.jtl` layout. Returns the number of
/// files written.
pub fn export_cycles(
    workspace: &Workspace,
    project_code: &str,
    cycle_ids: &[i64],
    destination: &Path,
) -> Result<usize, HailstormError> {
    let file = File::create(destination)?;
    let mut zip = ZipWriter::new(file);
    let options: FileOptions = FileOptions::default();

    let mut written = 0usize;
    for cycle_id in cycle_ids {
        let dir = workspace.cycle_results_dir(project_code, *cycle_id);
        if !dir.is_dir() {
            continue;
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        entries.sort();
        for path in entries {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            zip.start_file(format!("SEQUENCE-{cycle_id}/{name}"), options)
                .map_err(zip_error)?;
            let mut content = Vec::new();
            File::open(&path)?.read_to_end(&mut content)?;
            zip.write_all(&content)?;
            written += 1;
        }
    }
    zip.finish().map_err(zip_error)?;
    info!(files = written, destination = %destination.display(), "exported cycles");
    Ok(written)
}

/// Unpack an exported bundle, restoring the `SEQUENCE-<id>/` layout under
/// `destination_dir`. Returns the extracted file paths.
pub fn extract_bundle(
    bundle: &Path,
    destination_dir: &Path,
) -> Result<Vec<PathBuf>, HailstormError> {
    let file = File::open(bundle)?;
    let mut archive = ZipArchive::new(file).map_err(zip_error)?;
    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_error)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let target = destination_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        std::fs::write(&target, content)?;
        extracted.push(target);
    }
    Ok(extracted)
}

fn zip_error(err: zip::result::ZipError) -> HailstormError {
    HailstormError::Io(std::io::Error::other(err))
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Ingest an external JTL into the chosen cycle, or into a fresh `stopped`
/// cycle stamped from the samples' own time range when no cycle is given.
/// The file is copied into the cycle's staging directory so a later export
/// reproduces it. Returns the cycle the samples landed in.
pub fn import_jtl(
    store: &Store,
    workspace: &Workspace,
    project: &Project,
    plan: &JmeterPlan,
    clusterable_id: i64,
    clusterable_kind: ClusterKind,
    cycle_id: Option<i64>,
    source: &Path,
) -> Result<ExecutionCycle, HailstormError> {
    let samples = jtl::read_jtl(source)?;
    if samples.is_empty() {
        return Err(HailstormError::IncorrectCommand(format!(
            "'{}' contains no samples",
            source.display()
        )));
    }

    let cycle = match cycle_id {
        Some(id) => store.find_cycle(project.id, id)?.ok_or_else(|| {
            HailstormError::IncorrectCommand(format!(
                "no execution cycle {id} in project '{}'",
                project.project_code
            ))
        })?,
        None => {
            let started_ms = samples.iter().map(|s| s.timestamp_ms).min().unwrap_or(0);
            let stopped_ms = samples
                .iter()
                .map(|s| s.timestamp_ms + s.elapsed_ms as i64)
                .max()
                .unwrap_or(started_ms);
            let started_at = DateTime::from_timestamp_millis(started_ms)
                .unwrap_or_else(Utc::now);
            let stopped_at = DateTime::from_timestamp_millis(stopped_ms)
                .unwrap_or_else(Utc::now);
            let cycle =
                store.create_cycle(project.id, started_at, plan.latest_threads_count)?;
            store.update_cycle_status(cycle.id, CycleStatus::Stopped, Some(stopped_at))?;
            store
                .find_cycle(project.id, cycle.id)?
                .ok_or(HailstormError::Store(rusqlite::Error::QueryReturnedNoRows))?
        }
    };

    let staging = workspace.cycle_results_dir(&project.project_code, cycle.id);
    std::fs::create_dir_all(&staging)?;
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "imported.jtl".to_string());
    std::fs::copy(source, staging.join(&file_name))?;

    ingest_samples(
        store,
        &cycle,
        plan,
        clusterable_id,
        clusterable_kind,
        &samples,
        &project.breakup_intervals(),
    )?;
    info!(cycle = cycle.id, file = %file_name, "imported samples");
    Ok(cycle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
