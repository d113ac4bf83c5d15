//! Image URL governance pipeline: scan, preview, execute, report, alert, analyze.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use igov_adapters::StrategyRegistry;
use igov_core::{ExecutionOutcome, PreviewJob, PreviewResult};
use igov_storage::{
    DocumentStore, MemoryDocumentStore, PgDocumentStore, ReportStore, StoredReport,
};
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

mod alert;
mod analytics;
mod execute;
mod jobs;
mod scan;
mod schedule;
mod sinks;

pub use alert::{
    build_notification, dispatch_alert, evaluate_alert, AlertDecision, AlertThresholds,
};
pub use analytics::{
    Breakdown, DailyAnalytics, DailyReport, Performance, PerformancePoint, Progress, ProgressPoint,
    QualityPoint, ReportRange, SlowEntry, UnknownRange,
};
pub use execute::Executor;
pub use jobs::{new_job_id, system_clock, Clock, JobStore, MemoryJobStore};
pub use scan::Scanner;
pub use schedule::{maybe_build_scheduler, snapshot_once};
pub use sinks::{
    AlertNotification, GaugeSample, GovernanceMetrics, Labels, LogNotificationSink,
    MemoryNotificationSink, MetricsSink, NotificationSink, NotifyError, Severity, ADMIN_ROLE,
    CANDIDATES_COUNTER, REMAINING_GAUGE,
};

pub const CRATE_NAME: &str = "igov-governance";

const DEFAULT_JOB_TTL_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct GovernanceConfig {
    pub database_url: Option<String>,
    pub report_dir: PathBuf,
    pub canonical_origin: String,
    pub thresholds: AlertThresholds,
    pub job_ttl_secs: u64,
    pub preview_limit: usize,
    pub rescan_limit: usize,
    pub scheduler_enabled: bool,
    pub scheduler_interval_secs: u64,
    pub scheduler_limit: usize,
    pub admin_recipient: Option<String>,
    pub web_port: u16,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            report_dir: PathBuf::from("./reports"),
            canonical_origin: "http://localhost:5000".to_string(),
            thresholds: AlertThresholds::default(),
            job_ttl_secs: DEFAULT_JOB_TTL_SECS,
            preview_limit: 200,
            rescan_limit: 1000,
            scheduler_enabled: false,
            scheduler_interval_secs: 24 * 60 * 60,
            scheduler_limit: 5000,
            admin_recipient: None,
            web_port: 8000,
        }
    }
}

impl GovernanceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset, blank or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            database_url: get("DATABASE_URL"),
            report_dir: get("IGOV_REPORT_DIR").map(PathBuf::from).unwrap_or(defaults.report_dir),
            canonical_origin: get("IGOV_CANONICAL_ORIGIN").unwrap_or(defaults.canonical_origin),
            thresholds: AlertThresholds {
                invalid_count: parse_or(
                    get("IGOV_INVALID_COUNT_THRESHOLD"),
                    defaults.thresholds.invalid_count,
                ),
                invalid_ratio: parse_or(
                    get("IGOV_INVALID_RATIO_THRESHOLD"),
                    defaults.thresholds.invalid_ratio,
                ),
            },
            job_ttl_secs: get("IGOV_JOB_TTL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| ttl_duration(*secs).is_some())
                .unwrap_or(defaults.job_ttl_secs),
            preview_limit: parse_or(get("IGOV_PREVIEW_LIMIT"), defaults.preview_limit),
            rescan_limit: parse_or(get("IGOV_RESCAN_LIMIT"), defaults.rescan_limit),
            scheduler_enabled: get("IGOV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.scheduler_enabled),
            scheduler_interval_secs: parse_or(
                get("IGOV_SCHEDULER_INTERVAL_SECS"),
                defaults.scheduler_interval_secs,
            ),
            scheduler_limit: parse_or(get("IGOV_SCHEDULER_LIMIT"), defaults.scheduler_limit),
            admin_recipient: get("IGOV_ADMIN_RECIPIENT"),
            web_port: parse_or(get("IGOV_WEB_PORT"), defaults.web_port),
        }
    }

    /// Values too large for a `chrono::Duration` fall back to the default TTL.
    pub fn job_ttl(&self) -> chrono::Duration {
        ttl_duration(self.job_ttl_secs)
            .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_JOB_TTL_SECS as i64))
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn ttl_duration(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

/// Wires the pipeline components around one document store.
pub struct Governance {
    config: GovernanceConfig,
    store: Arc<dyn DocumentStore>,
    scanner: Arc<Scanner>,
    jobs: Arc<dyn JobStore>,
    executor: Executor,
    analytics: DailyAnalytics,
    reports: ReportStore,
}

impl Governance {
    pub fn new(
        config: GovernanceConfig,
        store: Arc<dyn DocumentStore>,
        jobs: Arc<dyn JobStore>,
        metrics: Arc<dyn MetricsSink>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let registry = Arc::new(StrategyRegistry::default());
        let reports = ReportStore::new(&config.report_dir);
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.canonical_origin.clone(),
        ));
        let executor = Executor::new(
            Arc::clone(&store),
            registry,
            Arc::clone(&jobs),
            Arc::clone(&scanner),
            reports.clone(),
            Arc::clone(&metrics),
            notifier,
            config.thresholds,
        );
        let analytics = DailyAnalytics::new(reports.clone(), metrics);
        Self {
            config,
            store,
            scanner,
            jobs,
            executor,
            analytics,
            reports,
        }
    }

    /// In-memory job store with the configured TTL, `metrics` facade and log-based alerts.
    pub fn with_defaults(config: GovernanceConfig, store: Arc<dyn DocumentStore>) -> Self {
        let jobs = Arc::new(MemoryJobStore::new(config.job_ttl()));
        let notifier = Arc::new(LogNotificationSink::new(config.admin_recipient.clone()));
        Self::new(config, store, jobs, Arc::new(GovernanceMetrics::new()), notifier)
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Scans read-only and stores the result as a new job.
    pub async fn preview(&self, limit_per_entity_kind: Option<usize>) -> Arc<PreviewJob> {
        let limit = limit_per_entity_kind.unwrap_or(self.config.preview_limit);
        let result = self.scanner.scan(limit).await;
        let job = self.jobs.put(result).await;
        info!(job_id = %job.job_id, limit, "preview job stored");
        job
    }

    pub async fn preview_result(&self, job_id: &str) -> Option<PreviewResult> {
        self.jobs.get(job_id).await.map(|job| job.result.clone())
    }

    /// A blank `job_id` is treated as absent and takes the rescan path.
    pub async fn execute(
        &self,
        job_id: Option<&str>,
        rescan_limit: Option<usize>,
    ) -> ExecutionOutcome {
        let job_id = job_id.map(str::trim).filter(|id| !id.is_empty());
        self.executor
            .execute_or_rescan(job_id, rescan_limit.unwrap_or(self.config.rescan_limit))
            .await
    }

    pub async fn daily_report(&self, range: ReportRange) -> DailyReport {
        self.analytics.build(range, Utc::now().date_naive()).await
    }

    pub async fn snapshot_once(&self) -> Result<StoredReport> {
        snapshot_once(
            &self.scanner,
            &self.reports,
            self.config.scheduler_limit,
            Utc::now().date_naive(),
        )
        .await
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        maybe_build_scheduler(
            &self.config,
            self.store.as_ref(),
            Arc::clone(&self.scanner),
            self.reports.clone(),
        )
        .await
    }
}

/// Postgres-backed when `DATABASE_URL` is set, otherwise an empty in-memory store.
pub async fn governance_from_env() -> Result<Governance> {
    let config = GovernanceConfig::from_env();
    let store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgDocumentStore::connect(url)
                .await
                .context("connecting document store")?,
        ),
        None => {
            info!("DATABASE_URL not set; using in-memory document store");
            Arc::new(MemoryDocumentStore::new())
        }
    };
    info!(
        backend = store.backend_name(),
        report_dir = %config.report_dir.display(),
        canonical_origin = %config.canonical_origin,
        "governance configured"
    );
    Ok(Governance::with_defaults(config, store))
}
