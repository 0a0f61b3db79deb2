use std::path::PathBuf;

use chrono::SecondsFormat;
use tracing::info;

use crate::error::HailstormError;
use crate::model::{ClientStat, CycleStatus, ExecutionCycle, PageStat, Project, TargetStat};
use crate::store::Store;
use crate::workspace::Workspace;

// ---------------------------------------------------------------------------
// ReportData
// ---------------------------------------------------------------------------

/// Everything a renderer needs for one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: ExecutionCycle,
    pub client_stats: Vec<(ClientStat, Vec<PageStat>)>,
    pub target_stats: Vec<TargetStat>,
}

/// Aggregated cross-cycle report input.
#[derive(Debug, Clone)]
pub struct ReportData {
    pub project_code: String,
    pub cycles: Vec<CycleReport>,
}

/// Renders aggregated stats into a document (the report renderer seam).
pub trait ReportRenderer: Send + Sync {
    fn render(&self, data: &ReportData) -> String;

    fn extension(&self) -> &'static str {
        "txt"
    }
}

/// Collect report data for the given cycles.
pub fn build_report_data(
    store: &Store,
    project: &Project,
    cycles: &[ExecutionCycle],
) -> Result<ReportData, HailstormError> {
    let mut reports = Vec::new();
    for cycle in cycles {
        let mut client_stats = Vec::new();
        for client in store.client_stats_for_cycle(cycle.id)? {
            let pages = store.page_stats_for_client(client.id)?;
            client_stats.push((client, pages));
        }
        reports.push(CycleReport {
            cycle: cycle.clone(),
            client_stats,
            target_stats: store.target_stats_for_cycle(cycle.id)?,
        });
    }
    Ok(ReportData {
        project_code: project.project_code.clone(),
        cycles: reports,
    })
}

/// Produce a report document over all reportable cycles in `cycle_ids`
/// (every `stopped`/`reported` cycle when no ids are given), write it under
/// `reports/`, and flip the included `stopped` cycles to `reported`.
pub fn create_report(
    store: &Store,
    workspace: &Workspace,
    project: &Project,
    cycle_ids: Option<&[i64]>,
    renderer: &dyn ReportRenderer,
) -> Result<PathBuf, HailstormError> {
    let cycles: Vec<ExecutionCycle> = store
        .cycles(project.id, cycle_ids)?
        .into_iter()
        .filter(ExecutionCycle::is_reportable)
        .collect();
    if cycles.is_empty() {
        return Err(HailstormError::IncorrectCommand(
            "no stopped or reported cycles to report on".to_string(),
        ));
    }

    let data = build_report_data(store, project, &cycles)?;
    let document = renderer.render(&data);

    let first = cycles.first().map(|c| c.id).unwrap_or(0);
    let last = cycles.last().map(|c| c.id).unwrap_or(first);
    let reports_dir = workspace.reports_dir(&project.project_code);
    std::fs::create_dir_all(&reports_dir)?;
    let path = reports_dir.join(format!(
        "{}-report-{first}-{last}.{}",
        project.project_code,
        renderer.extension()
    ));
    std::fs::write(&path, document)?;

    for cycle in &cycles {
        if cycle.status == CycleStatus::Stopped {
            store.update_cycle_status(cycle.id, CycleStatus::Reported, None)?;
        }
    }
    info!(path = %path.display(), cycles = cycles.len(), "report written");
    Ok(path)
}

// ---------------------------------------------------------------------------
// TextReportRenderer
// ---------------------------------------------------------------------------

/// Plain-text renderer used when no external renderer is wired in.
#[derive(Debug, Clone, Default)]
pub struct TextReportRenderer;

impl ReportRenderer for TextReportRenderer {
    fn render(&self, data: &ReportData) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Load test report — {}\n", data.project_code));
        out.push_str(&format!("# Cycles: {}\n\n", data.cycles.len()));

        for report in &data.cycles {
            let cycle = &report.cycle;
            out.push_str(&format!(
                "== Cycle {} ({}) ==\n",
                cycle.id, cycle.status
            ));
            out.push_str(&format!(
                "Started:  {}\n",
                cycle.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
            if let Some(stopped) = cycle.stopped_at {
                out.push_str(&format!(
                    "Stopped:  {}\n",
                    stopped.to_rfc3339_opts(SecondsFormat::Secs, true)
                ));
            }
            if let Some(threads) = cycle.threads_count {
                out.push_str(&format!("Threads:  {threads}\n"));
            }

            for (client, pages) in &report.client_stats {
                out.push_str(&format!(
                    "\nClient (plan {}, {} {}): threads {}, p90 {:.2} ms, throughput {:.2}/s\n",
                    client.jmeter_plan_id,
                    client.clusterable_kind,
                    client.clusterable_id,
                    client.threads_count,
                    client.aggregate_ninety_percentile,
                    client.aggregate_response_throughput
                ));
                out.push_str(
                    "  label | samples | avg | median | p90 | min | max | err% | rps | stddev\n",
                );
                for page in pages {
                    out.push_str(&format!(
                        "  {} | {} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2}\n",
                        page.page_label,
                        page.samples_count,
                        page.average_response_time,
                        page.median_response_time,
                        page.ninety_percentile_response_time,
                        page.minimum_response_time,
                        page.maximum_response_time,
                        page.percentage_errors,
                        page.response_throughput,
                        page.standard_deviation
                    ));
                }
            }

            for target in &report.target_stats {
                out.push_str(&format!(
                    "\nTarget host {}: cpu {:.1}%, memory {:.1}%{}\n",
                    target.target_host_id,
                    target.average_cpu_usage,
                    target.average_memory_usage,
                    target
                        .average_swap_usage
                        .map(|s| format!(", swap {s:.1}%"))
                        .unwrap_or_default()
                ));
            }
            out.push('\n');
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
