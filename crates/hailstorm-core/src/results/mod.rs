use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HailstormError;
use crate::model::{ClusterKind, ExecutionCycle, JmeterPlan, PageStat};
use crate::store::Store;

pub mod export;
pub mod jtl;
pub mod report;

pub use jtl::{parse_jtl, read_jtl, SampleRecord};

// ---------------------------------------------------------------------------
// Breakup histogram
// ---------------------------------------------------------------------------

/// One slot of the response-time distribution, e.g. `1 - 3` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BreakupSlot {
    pub range: String,
    pub count: u64,
}

/// Bucket response times (ms) by the configured second boundaries. For
/// `[1, 3, 5]` the slots are `< 1`, `1 - 3`, `3 - 5` and `>= 5`.
pub fn samples_breakup(times_ms: &[u64], intervals: &[u32]) -> Vec<BreakupSlot> {
    if intervals.is_empty() {
        return Vec::new();
    }
    let mut bounds = intervals.to_vec();
    bounds.sort_unstable();

    let mut slots: Vec<(String, u64, u64)> = Vec::new();
    let mut lower = 0u64;
    for (i, bound) in bounds.iter().enumerate() {
        let upper = *bound as u64 * 1000;
        let range = if i == 0 {
            format!("< {bound}")
        } else {
            format!("{} - {bound}", bounds[i - 1])
        };
        slots.push((range, lower, upper));
        lower = upper;
    }
    let last = bounds[bounds.len() - 1];
    slots.push((format!(">= {last}"), lower, u64::MAX));

    slots
        .into_iter()
        .map(|(range, low, high)| BreakupSlot {
            range,
            count: times_ms.iter().filter(|&&t| t >= low && t < high).count() as u64,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Page statistics
// ---------------------------------------------------------------------------

/// The p-th percentile of a sorted series, matching JMeter's report maths.
fn percentile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)] as f64
}

/// Compute one [`PageStat`] per page label from raw samples.
///
/// Throughputs derive from the samples' own time range, so recomputing from
/// the same file always reproduces the same rows. The returned stats carry
/// placeholder ids; the caller fills `client_stat_id` on insert.
pub fn compute_page_stats(
    samples: &[SampleRecord],
    breakup_intervals: &[u32],
) -> Result<Vec<PageStat>, HailstormError> {
    let mut by_label: BTreeMap<&str, Vec<&SampleRecord>> = BTreeMap::new();
    for sample in samples {
        by_label.entry(sample.label.as_str()).or_default().push(sample);
    }

    let mut stats = Vec::new();
    for (label, group) in by_label {
        let count = group.len() as u64;
        let mut times: Vec<u64> = group.iter().map(|s| s.elapsed_ms).collect();
        times.sort_unstable();

        let sum: u64 = times.iter().sum();
        let average = sum as f64 / count as f64;
        let variance = times
            .iter()
            .map(|&t| {
                let diff = t as f64 - average;
                diff * diff
            })
            .sum::<f64>()
            / count as f64;

        let errors = group.iter().filter(|s| !s.success).count() as u64;
        let total_bytes: u64 = group.iter().map(|s| s.bytes).sum();

        // Duration covered by this label's samples, from first start to last
        // completion. A single instantaneous sample still spans 1 ms.
        let first_start = group.iter().map(|s| s.timestamp_ms).min().unwrap_or(0);
        let last_end = group
            .iter()
            .map(|s| s.timestamp_ms + s.elapsed_ms as i64)
            .max()
            .unwrap_or(first_start);
        let duration_secs = ((last_end - first_start).max(1)) as f64 / 1000.0;

        stats.push(PageStat {
            id: 0,
            client_stat_id: 0,
            page_label: label.to_string(),
            samples_count: count,
            average_response_time: average,
            median_response_time: percentile(&times, 50.0),
            ninety_percentile_response_time: percentile(&times, 90.0),
            minimum_response_time: times[0] as f64,
            maximum_response_time: times[times.len() - 1] as f64,
            percentage_errors: errors as f64 / count as f64 * 100.0,
            response_throughput: count as f64 / duration_secs,
            size_throughput: total_bytes as f64 / duration_secs,
            standard_deviation: variance.sqrt(),
            samples_breakup_json: serde_json::to_string(&samples_breakup(
                &times,
                breakup_intervals,
            ))?,
        });
    }
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Client aggregation
// ---------------------------------------------------------------------------

/// Roll page stats up to the client level: sample-weighted 90th percentile,
/// summed throughput, and the latest sample completion time.
pub struct ClientAggregate {
    pub aggregate_ninety_percentile: f64,
    pub aggregate_response_throughput: f64,
    pub last_sample_at: Option<DateTime<Utc>>,
}

pub fn aggregate_client(samples: &[SampleRecord], page_stats: &[PageStat]) -> ClientAggregate {
    let total_samples: u64 = page_stats.iter().map(|p| p.samples_count).sum();
    let aggregate_ninety_percentile = if total_samples == 0 {
        0.0
    } else {
        page_stats
            .iter()
            .map(|p| p.ninety_percentile_response_time * p.samples_count as f64)
            .sum::<f64>()
            / total_samples as f64
    };
    let aggregate_response_throughput =
        page_stats.iter().map(|p| p.response_throughput).sum();
    let last_sample_at = samples
        .iter()
        .map(|s| s.timestamp_ms + s.elapsed_ms as i64)
        .max()
        .and_then(DateTime::from_timestamp_millis);

    ClientAggregate {
        aggregate_ninety_percentile,
        aggregate_response_throughput,
        last_sample_at,
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Parse-and-store one result set for `(cycle × plan × clusterable)`:
/// computes page stats, rolls them up, and writes the rows. Returns the new
/// client stat id, or `None` when the sample set is empty.
#[allow(clippy::too_many_arguments)]
pub fn ingest_samples(
    store: &Store,
    cycle: &ExecutionCycle,
    plan: &JmeterPlan,
    clusterable_id: i64,
    clusterable_kind: ClusterKind,
    samples: &[SampleRecord],
    breakup_intervals: &[u32],
) -> Result<Option<i64>, HailstormError> {
    if samples.is_empty() {
        return Ok(None);
    }
    let page_stats = compute_page_stats(samples, breakup_intervals)?;
    let aggregate = aggregate_client(samples, &page_stats);
    let client_stat_id = store.insert_client_stat(
        cycle.id,
        plan.id,
        clusterable_id,
        clusterable_kind,
        plan.latest_threads_count.unwrap_or(0),
        aggregate.aggregate_ninety_percentile,
        aggregate.aggregate_response_throughput,
        aggregate.last_sample_at,
    )?;
    for mut page_stat in page_stats {
        page_stat.client_stat_id = client_stat_id;
        store.insert_page_stat(&page_stat)?;
    }
    Ok(Some(client_stat_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sample(ts: i64, elapsed: u64, label: &str, success: bool, bytes: u64) -> SampleRecord {
        SampleRecord {
            timestamp_ms: ts,
            elapsed_ms: elapsed,
            label: label.to_string(),
            success,
            bytes,
        }
    }

    // -----------------------------------------------------------------------
    // samples_breakup
    // -----------------------------------------------------------------------

    #[test]
    fn breakup_buckets_cover_all_ranges() {
        // 0.5s, 2s, 4s, 9s
        let times = vec![500, 2_000, 4_000, 9_000];
        let slots = samples_breakup(&times, &[1, 3, 5]);
        let ranges: Vec<&str> = slots.iter().map(|s| s.range.as_str()).collect();
        assert_eq!(ranges, vec!["< 1", "1 - 3", "3 - 5", ">= 5"]);
        let counts: Vec<u64> = slots.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![1, 1, 1, 1]);
    }

    #[test]
    fn breakup_boundary_values_go_to_upper_bucket() {
        // Exactly 1s belongs to "1 - 3".
        let slots = samples_breakup(&[1_000], &[1, 3, 5]);
        assert_eq!(slots[0].count, 0);
        assert_eq!(slots[1].count, 1);
    }

    #[test]
    fn breakup_with_no_intervals_is_empty() {
        assert!(samples_breakup(&[100], &[]).is_empty());
    }

    #[test]
    fn breakup_counts_sum_to_sample_count() {
        let times: Vec<u64> = (0..50).map(|i| i * 200).collect();
        let slots = samples_breakup(&times, &[1, 3, 5]);
        let total: u64 = slots.iter().map(|s| s.count).sum();
        assert_eq!(total, 50);
    }

    // -----------------------------------------------------------------------
    // compute_page_stats
    // -----------------------------------------------------------------------

    #[test]
    fn page_stats_grouped_by_label_sorted() {
        let samples = vec![
            make_sample(0, 100, "home", true, 10),
            make_sample(1_000, 200, "checkout", true, 20),
            make_sample(2_000, 300, "home", true, 30),
        ];
        let stats = compute_page_stats(&samples, &[1, 3, 5]).expect("stats");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].page_label, "checkout");
        assert_eq!(stats[1].page_label, "home");
        assert_eq!(stats[1].samples_count, 2);
    }

    #[test]
    fn page_stats_response_time_summary() {
        let samples: Vec<SampleRecord> = [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100]
            .iter()
            .enumerate()
            .map(|(i, &elapsed)| make_sample(i as i64 * 1_000, elapsed, "page", true, 100))
            .collect();
        let stats = compute_page_stats(&samples, &[1]).expect("stats");
        let stat = &stats[0];
        assert_eq!(stat.samples_count, 10);
        assert!((stat.average_response_time - 55.0).abs() < 1e-9);
        assert!((stat.median_response_time - 50.0).abs() < 1e-9);
        assert!((stat.ninety_percentile_response_time - 90.0).abs() < 1e-9);
        assert!((stat.minimum_response_time - 10.0).abs() < 1e-9);
        assert!((stat.maximum_response_time - 100.0).abs() < 1e-9);
    }

    #[test]
    fn page_stats_error_percentage() {
        let samples = vec![
            make_sample(0, 100, "page", true, 0),
            make_sample(1_000, 100, "page", false, 0),
            make_sample(2_000, 100, "page", true, 0),
            make_sample(3_000, 100, "page", false, 0),
        ];
        let stats = compute_page_stats(&samples, &[1]).expect("stats");
        assert!((stats[0].percentage_errors - 50.0).abs() < 1e-9);
    }

    #[test]
    fn page_stats_throughput_from_sample_time_range() {
        // 10 samples spread over exactly 9 seconds plus the last sample's
        // 1000 ms elapsed => 10 seconds of activity.
        let samples: Vec<SampleRecord> = (0..10)
            .map(|i| make_sample(i * 1_000, 1_000, "page", true, 2_000))
            .collect();
        let stats = compute_page_stats(&samples, &[1]).expect("stats");
        let stat = &stats[0];
        assert!((stat.response_throughput - 1.0).abs() < 1e-9);
        assert!((stat.size_throughput - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn page_stats_single_sample() {
        let samples = vec![make_sample(5_000, 250, "solo", true, 1_024)];
        let stats = compute_page_stats(&samples, &[1, 3, 5]).expect("stats");
        let stat = &stats[0];
        assert_eq!(stat.samples_count, 1);
        assert!((stat.standard_deviation - 0.0).abs() < 1e-9);
        assert!(stat.response_throughput > 0.0);
    }

    #[test]
    fn page_stats_standard_deviation() {
        let samples = vec![
            make_sample(0, 10, "page", true, 0),
            make_sample(1_000, 30, "page", true, 0),
        ];
        let stats = compute_page_stats(&samples, &[1]).expect("stats");
        // Population stddev of {10, 30} is 10.
        assert!((stats[0].standard_deviation - 10.0).abs() < 1e-9);
    }

    #[test]
    fn page_stats_deterministic_across_runs() {
        let samples: Vec<SampleRecord> = (0..100)
            .map(|i| make_sample(i * 137, (i as u64 * 13) % 900, "page", i % 7 != 0, 512))
            .collect();
        let first = compute_page_stats(&samples, &[1, 3, 5]).expect("first");
        let second = compute_page_stats(&samples, &[1, 3, 5]).expect("second");
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert!((a.average_response_time - b.average_response_time).abs() < 1e-6);
            assert!((a.response_throughput - b.response_throughput).abs() < 1e-6);
            assert_eq!(a.samples_breakup_json, b.samples_breakup_json);
        }
    }

    // -----------------------------------------------------------------------
    // aggregate_client
    // -----------------------------------------------------------------------

    #[test]
    fn client_aggregate_weights_percentile_by_samples() {
        let samples = vec![
            make_sample(0, 100, "a", true, 0),
            make_sample(1_000, 100, "a", true, 0),
            make_sample(2_000, 100, "a", true, 0),
            make_sample(3_000, 400, "b", true, 0),
        ];
        let pages = compute_page_stats(&samples, &[1]).expect("pages");
        let aggregate = aggregate_client(&samples, &pages);
        // a: p90=100 weight 3; b: p90=400 weight 1 => 175.
        assert!((aggregate.aggregate_ninety_percentile - 175.0).abs() < 1e-9);
    }

    #[test]
    fn client_aggregate_last_sample_at() {
        let samples = vec![
            make_sample(1_700_000_000_000, 500, "a", true, 0),
            make_sample(1_700_000_010_000, 250, "a", true, 0),
        ];
        let pages = compute_page_stats(&samples, &[1]).expect("pages");
        let aggregate = aggregate_client(&samples, &pages);
        let last = aggregate.last_sample_at.expect("timestamp");
        assert_eq!(last.timestamp_millis(), 1_700_000_010_250);
    }

    // -----------------------------------------------------------------------
    // ingest_samples
    // -----------------------------------------------------------------------

    #[test]
    fn ingest_writes_client_and_page_rows() {
        let store = Store::open_in_memory().expect("store");
        let project = store.find_or_create_project("shop").expect("project");
        let plan = store
            .upsert_jmeter_plan(project.id, "checkout.jmx", "h", "{}", Some(100))
            .expect("plan");
        let cycle = store
            .create_cycle(project.id, Utc::now(), Some(100))
            .expect("cycle");

        let samples = vec![
            make_sample(0, 100, "home", true, 1_000),
            make_sample(1_000, 200, "cart", false, 2_000),
        ];
        let client_stat_id = ingest_samples(
            &store,
            &cycle,
            &plan,
            7,
            ClusterKind::AmazonCloud,
            &samples,
            &[1, 3, 5],
        )
        .expect("ingest")
        .expect("rows written");

        let clients = store.client_stats_for_cycle(cycle.id).expect("clients");
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, client_stat_id);
        assert_eq!(clients[0].threads_count, 100);

        let pages = store.page_stats_for_client(client_stat_id).expect("pages");
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.client_stat_id == client_stat_id));
    }

    #[test]
    fn ingest_empty_samples_writes_nothing() {
        let store = Store::open_in_memory().expect("store");
        let project = store.find_or_create_project("shop").expect("project");
        let plan = store
            .upsert_jmeter_plan(project.id, "checkout.jmx", "h", "{}", None)
            .expect("plan");
        let cycle = store.create_cycle(project.id, Utc::now(), None).expect("cycle");

        let result = ingest_samples(
            &store,
            &cycle,
            &plan,
            1,
            ClusterKind::DataCenter,
            &[],
            &[1],
        )
        .expect("ingest");
        assert!(result.is_none());
        assert!(store.client_stats_for_cycle(cycle.id).expect("clients").is_empty());
    }
}
