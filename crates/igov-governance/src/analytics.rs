//! Daily analytics read-model reconstructed from persisted report files.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use igov_core::PreviewSummary;
use igov_storage::{
    execution_report_date, snapshot_date, ReportEntry, ReportStore, EXECUTION_REPORT_PREFIX,
    SNAPSHOT_PREFIX,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::sinks::{MetricsSink, REMAINING_GAUGE};

const TOP_SLOWEST: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportRange {
    Day,
    Week,
    Month,
}

impl ReportRange {
    pub fn days(&self) -> i64 {
        match self {
            ReportRange::Day => 1,
            ReportRange::Week => 7,
            ReportRange::Month => 30,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown report range {0:?}; expected day, week or month")]
pub struct UnknownRange(pub String);

impl FromStr for ReportRange {
    type Err = UnknownRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(ReportRange::Day),
            "week" => Ok(ReportRange::Week),
            "month" => Ok(ReportRange::Month),
            _ => Err(UnknownRange(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPoint {
    pub date: NaiveDate,
    pub processed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub daily: Vec<ProgressPoint>,
    pub processed: usize,
    pub remaining: f64,
    pub total_basis: f64,
    pub completion_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityPoint {
    pub date: NaiveDate,
    pub total_candidates: usize,
    pub ratios: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformancePoint {
    pub date: NaiveDate,
    pub durations_ms: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowEntry {
    pub date: NaiveDate,
    pub entity_kind: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub daily: Vec<PerformancePoint>,
    pub top_slowest: Vec<SlowEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub date: NaiveDate,
    pub total_candidates: usize,
    pub by_entity_kind: BTreeMap<String, usize>,
    pub by_reason: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    pub range: ReportRange,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub progress: Progress,
    pub quality: Vec<QualityPoint>,
    pub performance: Performance,
    pub breakdown: Option<Breakdown>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ExecutionReportView {
    updated_count: usize,
    model_durations_ms: BTreeMap<String, u64>,
}

#[derive(Debug, Deserialize)]
struct SnapshotView {
    summary: PreviewSummary,
}

/// Reads report files only; never writes.
pub struct DailyAnalytics {
    reports: ReportStore,
    metrics: Arc<dyn MetricsSink>,
}

impl DailyAnalytics {
    pub fn new(reports: ReportStore, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { reports, metrics }
    }

    async fn entries_in_window(
        &self,
        prefix: &str,
        date_of: fn(&str) -> Option<NaiveDate>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Vec<(NaiveDate, ReportEntry)> {
        let entries = match self.reports.list(prefix).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %format!("{err:#}"), prefix, "listing report files failed");
                return Vec::new();
            }
        };
        entries
            .into_iter()
            .filter_map(|entry| date_of(&entry.file_name).map(|date| (date, entry)))
            .filter(|(date, _)| *date >= from && *date <= to)
            .collect()
    }

    async fn load<T: serde::de::DeserializeOwned>(&self, entry: &ReportEntry) -> Option<T> {
        match self.reports.read_json::<T>(&entry.path).await {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(
                    file = %entry.file_name,
                    error = %format!("{err:#}"),
                    "skipping unreadable report"
                );
                None
            }
        }
    }

    /// Newest readable snapshot dated before `from`.
    async fn latest_before(
        &self,
        entries: &[(NaiveDate, ReportEntry)],
        from: NaiveDate,
    ) -> Option<(NaiveDate, PreviewSummary)> {
        for (date, entry) in entries.iter().rev().filter(|(date, _)| *date < from) {
            if let Some(view) = self.load::<SnapshotView>(entry).await {
                return Some((*date, view.summary));
            }
        }
        None
    }

    /// Builds the series for the `range.days()` calendar days ending at `today`.
    pub async fn build(&self, range: ReportRange, today: NaiveDate) -> DailyReport {
        let from = today - Duration::days(range.days() - 1);

        let mut processed_by_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        let mut durations_by_day: BTreeMap<NaiveDate, BTreeMap<String, u64>> = BTreeMap::new();
        for (date, entry) in self
            .entries_in_window(EXECUTION_REPORT_PREFIX, execution_report_date, from, today)
            .await
        {
            let Some(view) = self.load::<ExecutionReportView>(&entry).await else {
                continue;
            };
            *processed_by_day.entry(date).or_default() += view.updated_count;
            let day = durations_by_day.entry(date).or_default();
            for (kind, ms) in view.model_durations_ms {
                *day.entry(kind).or_default() += ms;
            }
        }

        let snapshot_entries = self
            .entries_in_window(SNAPSHOT_PREFIX, snapshot_date, NaiveDate::MIN, today)
            .await;
        let mut snapshots: Vec<(NaiveDate, PreviewSummary)> = Vec::new();
        for (date, entry) in snapshot_entries.iter().filter(|(date, _)| *date >= from) {
            if let Some(view) = self.load::<SnapshotView>(entry).await {
                snapshots.push((*date, view.summary));
            }
        }
        snapshots.sort_by_key(|(date, _)| *date);
        let latest = match snapshots.last() {
            Some(latest) => Some(latest.clone()),
            None => self.latest_before(&snapshot_entries, from).await,
        };

        let remaining: f64 = self
            .metrics
            .gauge_snapshot(REMAINING_GAUGE)
            .iter()
            .map(|sample| sample.value)
            .sum();

        DailyReport {
            range,
            from,
            to: today,
            progress: progress(from, today, &processed_by_day, remaining, latest.as_ref()),
            quality: quality(&snapshots),
            performance: performance(durations_by_day),
            breakdown: latest.map(|(date, summary)| Breakdown {
                date,
                total_candidates: summary.total_candidates,
                by_entity_kind: summary.by_entity_kind,
                by_reason: summary.by_reason,
            }),
        }
    }
}

fn progress(
    from: NaiveDate,
    to: NaiveDate,
    processed_by_day: &BTreeMap<NaiveDate, usize>,
    remaining: f64,
    latest_snapshot: Option<&(NaiveDate, PreviewSummary)>,
) -> Progress {
    let daily = from
        .iter_days()
        .take_while(|d| *d <= to)
        .map(|date| ProgressPoint {
            date,
            processed: processed_by_day.get(&date).copied().unwrap_or(0),
        })
        .collect::<Vec<_>>();
    let processed = daily.iter().map(|p| p.processed).sum::<usize>();

    let total_basis = match latest_snapshot {
        Some((_, summary)) if summary.total_candidates > 0 => summary.total_candidates as f64,
        _ => processed as f64 + remaining,
    };
    let completion_pct = if total_basis > 0.0 {
        (processed as f64 / total_basis * 100.0).min(100.0)
    } else {
        100.0
    };

    Progress {
        daily,
        processed,
        remaining,
        total_basis,
        completion_pct,
    }
}

fn quality(snapshots: &[(NaiveDate, PreviewSummary)]) -> Vec<QualityPoint> {
    snapshots
        .iter()
        .map(|(date, summary)| {
            let total = summary.total_candidates;
            let ratios = summary
                .by_reason
                .iter()
                .map(|(reason, count)| (reason.clone(), *count as f64 / total.max(1) as f64))
                .collect();
            QualityPoint {
                date: *date,
                total_candidates: total,
                ratios,
            }
        })
        .collect()
}

fn performance(durations_by_day: BTreeMap<NaiveDate, BTreeMap<String, u64>>) -> Performance {
    let mut top_slowest = durations_by_day
        .iter()
        .flat_map(|(date, kinds)| {
            kinds.iter().map(|(kind, ms)| SlowEntry {
                date: *date,
                entity_kind: kind.clone(),
                duration_ms: *ms,
            })
        })
        .collect::<Vec<_>>();
    top_slowest.sort_by(|a, b| {
        b.duration_ms
            .cmp(&a.duration_ms)
            .then_with(|| a.date.cmp(&b.date))
            .then_with(|| a.entity_kind.cmp(&b.entity_kind))
    });
    top_slowest.truncate(TOP_SLOWEST);

    Performance {
        daily: durations_by_day
            .into_iter()
            .map(|(date, durations_ms)| PerformancePoint { date, durations_ms })
            .collect(),
        top_slowest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::GovernanceMetrics;
    use serde_json::json;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn snapshot(total: usize, invalid: usize) -> serde_json::Value {
        json!({
            "startedAt": "2026-10-01T00:00:00Z",
            "finishedAt": "2026-10-01T00:00:01Z",
            "durationMs": 1000,
            "summary": {
                "totalCandidates": total,
                "byEntityKind": {"user": total},
                "byReason": {"invalid": invalid, "uploads_prefix_added": total - invalid},
            },
            "sampleChanges": [],
        })
    }

    #[test]
    fn ranges_parse_case_insensitively() {
        assert_eq!("Week".parse::<ReportRange>(), Ok(ReportRange::Week));
        assert_eq!(ReportRange::Month.days(), 30);
        assert!("year".parse::<ReportRange>().is_err());
    }

    #[tokio::test]
    async fn builds_series_from_report_files() {
        let dir = tempdir().expect("tempdir");
        let reports = ReportStore::new(dir.path());
        reports
            .write_json("daily-preview-2026-10-17.json", &snapshot(10, 1))
            .await
            .unwrap();
        reports
            .write_json("daily-preview-2026-10-19.json", &snapshot(40, 4))
            .await
            .unwrap();
        reports
            .write_json(
                "image-url-cleanup-2026-10-18T10-00-00-000Z.json",
                &json!({"updatedCount": 6, "modelDurationsMs": {"user": 120, "post": 30}}),
            )
            .await
            .unwrap();
        reports
            .write_json(
                "image-url-cleanup-2026-10-18T12-00-00-000Z.json",
                &json!({"updatedCount": 4, "modelDurationsMs": {"user": 80}}),
            )
            .await
            .unwrap();
        reports
            .write_json(
                "image-url-cleanup-2026-10-19T01-00-00-000Z.json",
                &json!({"updatedCount": 10, "modelDurationsMs": {"pet": 500}}),
            )
            .await
            .unwrap();
        let broken = dir.path().join("image-url-cleanup-2026-10-19T02-00-00-000Z.json");
        std::fs::write(broken, "{not json").unwrap();
        reports
            .write_json(
                "image-url-cleanup-2026-09-01T00-00-00-000Z.json",
                &json!({"updatedCount": 999}),
            )
            .await
            .unwrap();

        let analytics = DailyAnalytics::new(reports, Arc::new(GovernanceMetrics::new()));
        let report = analytics.build(ReportRange::Week, day(19)).await;

        assert_eq!(report.from, day(13));
        assert_eq!(report.progress.daily.len(), 7);
        assert_eq!(report.progress.processed, 20);
        assert_eq!(report.progress.total_basis, 40.0);
        assert_eq!(report.progress.completion_pct, 50.0);

        assert_eq!(report.quality.len(), 2);
        assert_eq!(report.quality[1].ratios["invalid"], 0.1);

        assert_eq!(report.performance.daily.len(), 2);
        assert_eq!(report.performance.daily[0].durations_ms["user"], 200);
        assert_eq!(report.performance.top_slowest[0].entity_kind, "pet");
        assert_eq!(report.performance.top_slowest[1].duration_ms, 200);

        let breakdown = report.breakdown.expect("latest snapshot");
        assert_eq!(breakdown.date, day(19));
        assert_eq!(breakdown.total_candidates, 40);
    }

    #[tokio::test]
    async fn empty_directory_yields_complete_empty_report() {
        let dir = tempdir().expect("tempdir");
        let analytics = DailyAnalytics::new(
            ReportStore::new(dir.path().join("missing")),
            Arc::new(GovernanceMetrics::new()),
        );
        let report = analytics.build(ReportRange::Day, day(19)).await;
        assert_eq!(report.progress.daily.len(), 1);
        assert_eq!(report.progress.processed, 0);
        assert_eq!(report.progress.completion_pct, 100.0);
        assert!(report.quality.is_empty());
        assert!(report.breakdown.is_none());
    }

    #[tokio::test]
    async fn basis_uses_latest_snapshot_before_the_window() {
        let dir = tempdir().expect("tempdir");
        let reports = ReportStore::new(dir.path());
        reports
            .write_json("daily-preview-2026-10-10.json", &snapshot(100, 0))
            .await
            .unwrap();
        reports
            .write_json("daily-preview-2026-10-18.json", &snapshot(40, 2))
            .await
            .unwrap();
        reports
            .write_json("daily-preview-2026-10-20.json", &snapshot(7, 0))
            .await
            .unwrap();
        reports
            .write_json(
                "image-url-cleanup-2026-10-19T08-00-00-000Z.json",
                &json!({"updatedCount": 10}),
            )
            .await
            .unwrap();

        let analytics = DailyAnalytics::new(reports, Arc::new(GovernanceMetrics::new()));
        let report = analytics.build(ReportRange::Day, day(19)).await;

        assert!(report.quality.is_empty());
        assert_eq!(report.progress.total_basis, 40.0);
        assert_eq!(report.progress.completion_pct, 25.0);
        let breakdown = report.breakdown.expect("yesterday's snapshot");
        assert_eq!(breakdown.date, day(18));
        assert_eq!(breakdown.by_reason["invalid"], 2);
    }

    #[tokio::test]
    async fn falls_back_to_processed_plus_remaining() {
        let dir = tempdir().expect("tempdir");
        let reports = ReportStore::new(dir.path());
        reports
            .write_json(
                "image-url-cleanup-2026-10-19T01-00-00-000Z.json",
                &json!({"updatedCount": 3}),
            )
            .await
            .unwrap();
        let metrics = Arc::new(GovernanceMetrics::new());
        metrics.set_gauge(REMAINING_GAUGE, &vec![("entity_kind", "user".to_string())], 1.0);

        let analytics = DailyAnalytics::new(reports, metrics);
        let report = analytics.build(ReportRange::Day, day(19)).await;
        assert_eq!(report.progress.total_basis, 4.0);
        assert_eq!(report.progress.completion_pct, 75.0);
    }
}
