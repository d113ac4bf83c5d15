//! Migration executor: applies a preview's candidates as grouped bulk updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use igov_adapters::StrategyRegistry;
use igov_core::{ExecutionKind, ExecutionOutcome, ExecutionResult, FailureRecord, PreviewJob};
use igov_storage::{
    execution_report_name, suffixed_name, DocumentStore, ReportStore, UpdateOperation,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::alert::{
    build_notification, dispatch_alert, evaluate_alert, AlertDecision, AlertThresholds,
};
use crate::jobs::JobStore;
use crate::scan::Scanner;
use crate::sinks::{MetricsSink, NotificationSink, CANDIDATES_COUNTER, REMAINING_GAUGE};

const METRIC_ORIGIN: &str = "backend";
const REPORT_NAME_ATTEMPTS: usize = 16;

/// Audit report body: the execution result plus the alert evaluation.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionReport<'a> {
    #[serde(flatten)]
    result: &'a ExecutionResult,
    alert: &'a AlertDecision,
}

pub struct Executor {
    store: Arc<dyn DocumentStore>,
    registry: Arc<StrategyRegistry>,
    jobs: Arc<dyn JobStore>,
    scanner: Arc<Scanner>,
    reports: ReportStore,
    metrics: Arc<dyn MetricsSink>,
    notifier: Arc<dyn NotificationSink>,
    thresholds: AlertThresholds,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<StrategyRegistry>,
        jobs: Arc<dyn JobStore>,
        scanner: Arc<Scanner>,
        reports: ReportStore,
        metrics: Arc<dyn MetricsSink>,
        notifier: Arc<dyn NotificationSink>,
        thresholds: AlertThresholds,
    ) -> Self {
        Self {
            store,
            registry,
            jobs,
            scanner,
            reports,
            metrics,
            notifier,
            thresholds,
        }
    }

    /// Executes the stored preview `job_id`, or, when it is missing or expired,
    /// rescans with `rescan_limit`, stores the rescan under a new id and executes that.
    ///
    /// The rescan path may write changes the caller never previewed; the returned
    /// `kind` tells the two apart.
    pub async fn execute_or_rescan(
        &self,
        job_id: Option<&str>,
        rescan_limit: usize,
    ) -> ExecutionOutcome {
        if let Some(id) = job_id {
            if let Some(job) = self.jobs.get(id).await {
                let result = self.execute_job(&job).await;
                return ExecutionOutcome {
                    kind: ExecutionKind::Executed,
                    requested_job_id: Some(id.to_string()),
                    job_id: job.job_id.clone(),
                    result,
                };
            }
        }

        warn!(
            requested_job_id = job_id.unwrap_or("<none>"),
            rescan_limit,
            "preview job missing or expired; rescanning before execute"
        );
        let fresh = self.scanner.scan(rescan_limit).await;
        let job = self.jobs.put(fresh).await;
        let result = self.execute_job(&job).await;
        ExecutionOutcome {
            kind: ExecutionKind::Rescanned,
            requested_job_id: job_id.map(str::to_string),
            job_id: job.job_id.clone(),
            result,
        }
    }

    /// Applies exactly the candidates of `job`. Never fails: build errors land in
    /// `failures`, store errors only lower `updated_count`, and report/alert
    /// side effects are surfaced as flags.
    pub async fn execute_job(&self, job: &PreviewJob) -> ExecutionResult {
        let span = info_span!("execute_job", job_id = %job.job_id);
        async {
            let mut failures = Vec::new();
            let mut grouped: HashMap<String, Vec<UpdateOperation>> = HashMap::new();

            for candidate in &job.result.sample_changes {
                match self.registry.build_operation(candidate) {
                    Ok(op) => grouped
                        .entry(candidate.reference.entity_kind.clone())
                        .or_default()
                        .push(op),
                    Err(err) => failures.push(FailureRecord {
                        entity_kind: candidate.reference.entity_kind.clone(),
                        document_id: candidate.reference.document_id.clone(),
                        field_path: candidate.reference.field_path.clone(),
                        error_message: err.to_string(),
                    }),
                }
            }

            let mut updated_count = 0usize;
            let mut model_durations_ms = BTreeMap::new();
            for descriptor in self.registry.descriptors() {
                let Some(ops) = grouped.remove(descriptor.entity_kind) else {
                    continue;
                };
                let op_count = ops.len();
                let started = Instant::now();
                match self.store.bulk_update(descriptor.collection, ops).await {
                    Ok(summary) => {
                        updated_count += summary.modified.min(op_count);
                        if !summary.failures.is_empty() {
                            warn!(
                                entity_kind = descriptor.entity_kind,
                                failed = summary.failures.len(),
                                "bulk update finished with per-operation failures"
                            );
                        }
                    }
                    Err(err) => warn!(
                        entity_kind = descriptor.entity_kind,
                        error = %err,
                        "bulk update batch failed"
                    ),
                }
                model_durations_ms.insert(
                    descriptor.entity_kind.to_string(),
                    started.elapsed().as_millis() as u64,
                );
            }

            self.record_metrics(job);

            let mut result = ExecutionResult {
                job_id: job.job_id.clone(),
                preview: job.result.clone(),
                updated_count,
                failed_count: failures.len(),
                failures,
                report_file: None,
                model_durations_ms,
                remaining_computed: false,
                report_persisted: false,
                alert_dispatched: false,
            };

            let decision = evaluate_alert(&result.preview.summary, &self.thresholds);
            self.persist_report(&mut result, &decision).await;

            if decision.fire {
                let notification = build_notification(
                    &decision,
                    &result.preview.summary,
                    &result.job_id,
                    result.report_file.as_deref(),
                );
                result.alert_dispatched =
                    dispatch_alert(self.notifier.as_ref(), &notification).await;
            }

            info!(
                candidates = result.preview.summary.total_candidates,
                updated = result.updated_count,
                failed = result.failed_count,
                report_persisted = result.report_persisted,
                alert_fired = decision.fire,
                "image url migration executed"
            );
            result
        }
        .instrument(span)
        .await
    }

    fn record_metrics(&self, job: &PreviewJob) {
        for candidate in &job.result.sample_changes {
            let labels = vec![
                ("origin", METRIC_ORIGIN.to_string()),
                ("reason_code", candidate.outcome.reason_code.to_string()),
                ("entity_kind", candidate.reference.entity_kind.clone()),
            ];
            self.metrics.increment_counter(CANDIDATES_COUNTER, &labels, 1);
        }
        // Outstanding counts are not computed here; the gauge is pinned to 0.
        for descriptor in self.registry.descriptors() {
            let labels = vec![
                ("origin", METRIC_ORIGIN.to_string()),
                ("type", "remaining".to_string()),
                ("entity_kind", descriptor.entity_kind.to_string()),
            ];
            self.metrics.set_gauge(REMAINING_GAUGE, &labels, 0.0);
        }
    }

    /// Reports sharing a timestamp get a numeric suffix; an existing report is never replaced.
    async fn persist_report(&self, result: &mut ExecutionResult, decision: &AlertDecision) {
        let base = execution_report_name(Utc::now());
        for attempt in 0..REPORT_NAME_ATTEMPTS {
            let file_name = suffixed_name(&base, attempt);
            let path = self.reports.root().join(&file_name);
            result.report_file = Some(path.display().to_string());
            result.report_persisted = true;

            let report = ExecutionReport {
                result: &*result,
                alert: decision,
            };
            match self.reports.create_json(&file_name, &report).await {
                Ok(Some(stored)) => {
                    info!(
                        path = %stored.absolute_path.display(),
                        bytes = stored.byte_size,
                        "execution report written"
                    );
                    return;
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to write execution report");
                    result.report_file = None;
                    result.report_persisted = false;
                    return;
                }
            }
        }
        warn!(base = %base, "no free execution report name");
        result.report_file = None;
        result.report_persisted = false;
    }
}
