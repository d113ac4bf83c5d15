//! Periodic preview snapshots for the analytics read-model.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use igov_storage::{snapshot_name, DocumentStore, ReportStore, StoredReport};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::scan::Scanner;
use crate::GovernanceConfig;

/// Scans with `limit` per entity kind and writes the dated snapshot for `today`,
/// replacing an earlier snapshot of the same day.
pub async fn snapshot_once(
    scanner: &Scanner,
    reports: &ReportStore,
    limit: usize,
    today: NaiveDate,
) -> Result<StoredReport> {
    let result = scanner.scan(limit).await;
    let file_name = snapshot_name(today);
    let stored = reports
        .write_json(&file_name, &result)
        .await
        .with_context(|| format!("writing snapshot {file_name}"))?;
    info!(
        path = %stored.absolute_path.display(),
        candidates = result.summary.total_candidates,
        "daily preview snapshot written"
    );
    Ok(stored)
}

/// `None` when scheduling is disabled or the store cannot back governance runs.
pub async fn maybe_build_scheduler(
    config: &GovernanceConfig,
    store: &dyn DocumentStore,
    scanner: Arc<Scanner>,
    reports: ReportStore,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    if !store.supports_governance() {
        warn!(
            backend = store.backend_name(),
            "document store does not support governance; scheduler not started"
        );
        return Ok(None);
    }

    let interval = Duration::from_secs(config.scheduler_interval_secs.max(1));
    let limit = config.scheduler_limit;
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let scanner = Arc::clone(&scanner);
        let reports = reports.clone();
        Box::pin(async move {
            let today = Utc::now().date_naive();
            if let Err(err) = snapshot_once(&scanner, &reports, limit, today).await {
                warn!(error = %format!("{err:#}"), "scheduled snapshot failed");
            }
        })
    })
    .with_context(|| format!("creating snapshot job every {}s", interval.as_secs()))?;
    sched.add(job).await.context("adding snapshot job")?;
    info!(interval_secs = interval.as_secs(), limit, "snapshot scheduler configured");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use igov_adapters::StrategyRegistry;
    use igov_core::PreviewResult;
    use igov_storage::MemoryDocumentStore;
    use serde_json::json;
    use tempfile::tempdir;

    async fn scanner() -> Arc<Scanner> {
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("users", "u1", json!({"avatar": "pic.jpg"})).await;
        Arc::new(Scanner::new(
            store,
            Arc::new(StrategyRegistry::default()),
            "http://localhost:5000",
        ))
    }

    #[tokio::test]
    async fn snapshot_overwrites_same_day_file() {
        let dir = tempdir().expect("tempdir");
        let reports = ReportStore::new(dir.path());
        let scanner = scanner().await;
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let first = snapshot_once(&scanner, &reports, 10, today).await.unwrap();
        let second = snapshot_once(&scanner, &reports, 10, today).await.unwrap();
        assert_eq!(first.file_name, "daily-preview-2026-10-19.json");
        assert_eq!(first.absolute_path, second.absolute_path);

        let entries = reports.list("daily-preview-").await.unwrap();
        assert_eq!(entries.len(), 1);
        let stored: PreviewResult = reports.read_json(&entries[0].path).await.unwrap();
        assert_eq!(stored.summary.total_candidates, 1);
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let dir = tempdir().expect("tempdir");
        let config = GovernanceConfig::default();
        let store = MemoryDocumentStore::new();
        let reports = ReportStore::new(dir.path());
        let built = maybe_build_scheduler(&config, &store, scanner().await, reports)
            .await
            .unwrap();
        assert!(built.is_none());
    }
}
