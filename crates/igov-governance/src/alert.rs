//! Invalid-URL anomaly alerting.

use igov_core::{PreviewSummary, ReasonCode};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::sinks::{AlertNotification, NotificationSink, Severity, ADMIN_ROLE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub invalid_count: usize,
    pub invalid_ratio: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            invalid_count: 50,
            invalid_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDecision {
    pub invalid_count: usize,
    pub invalid_ratio: f64,
    pub fire: bool,
}

/// Fires when either the invalid count or the invalid ratio reaches its threshold.
pub fn evaluate_alert(summary: &PreviewSummary, thresholds: &AlertThresholds) -> AlertDecision {
    let invalid_count = summary.reason_count(ReasonCode::Invalid);
    let invalid_ratio = invalid_count as f64 / summary.total_candidates.max(1) as f64;
    AlertDecision {
        invalid_count,
        invalid_ratio,
        fire: invalid_count >= thresholds.invalid_count
            || invalid_ratio >= thresholds.invalid_ratio,
    }
}

pub fn build_notification(
    decision: &AlertDecision,
    summary: &PreviewSummary,
    job_id: &str,
    report_file: Option<&str>,
) -> AlertNotification {
    AlertNotification {
        recipient_role: ADMIN_ROLE.to_string(),
        title: "Image URL governance: invalid URL threshold reached".to_string(),
        message: format!(
            "{} invalid image URLs ({:.1}% of {} candidates) in job {}; report: {}",
            decision.invalid_count,
            decision.invalid_ratio * 100.0,
            summary.total_candidates,
            job_id,
            report_file.unwrap_or("not persisted"),
        ),
        severity: Severity::High,
        metadata: json!({
            "jobId": job_id,
            "reportFile": report_file,
            "invalidCount": decision.invalid_count,
            "invalidRatio": decision.invalid_ratio,
            "byReason": summary.by_reason,
            "byEntityKind": summary.by_entity_kind,
        }),
    }
}

/// Best effort: returns whether the sink accepted the notification.
pub async fn dispatch_alert(sink: &dyn NotificationSink, notification: &AlertNotification) -> bool {
    let Some(recipient) = sink.resolve_recipient(&notification.recipient_role).await else {
        warn!(
            role = %notification.recipient_role,
            "no recipient resolved for governance alert; skipping"
        );
        return false;
    };
    match sink.send(&recipient, notification).await {
        Ok(()) => {
            info!(%recipient, "governance alert dispatched");
            true
        }
        Err(err) => {
            warn!(%recipient, error = %err, "governance alert dispatch failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::MemoryNotificationSink;
    use std::collections::BTreeMap;

    fn summary(total: usize, invalid: usize) -> PreviewSummary {
        let mut by_reason = BTreeMap::new();
        if invalid > 0 {
            by_reason.insert("invalid".to_string(), invalid);
        }
        if total > invalid {
            by_reason.insert("port_rewrite".to_string(), total - invalid);
        }
        PreviewSummary {
            total_candidates: total,
            by_entity_kind: BTreeMap::from([("user".to_string(), total)]),
            by_reason,
        }
    }

    #[test]
    fn count_threshold_is_inclusive() {
        let thresholds = AlertThresholds {
            invalid_count: 50,
            invalid_ratio: 0.5,
        };
        assert!(evaluate_alert(&summary(1000, 50), &thresholds).fire);
        let below = evaluate_alert(&summary(1000, 49), &thresholds);
        assert!(!below.fire);
        assert_eq!(below.invalid_count, 49);
    }

    #[test]
    fn ratio_threshold_is_inclusive() {
        let thresholds = AlertThresholds {
            invalid_count: 1_000,
            invalid_ratio: 0.05,
        };
        assert!(evaluate_alert(&summary(100, 5), &thresholds).fire);
        assert!(!evaluate_alert(&summary(100, 4), &thresholds).fire);
    }

    #[test]
    fn empty_summary_never_divides_by_zero() {
        let decision = evaluate_alert(&PreviewSummary::default(), &AlertThresholds::default());
        assert_eq!(decision.invalid_ratio, 0.0);
        assert!(!decision.fire);
    }

    #[tokio::test]
    async fn dispatch_reports_outcome() {
        let s = summary(10, 10);
        let decision = evaluate_alert(&s, &AlertThresholds::default());
        let notification = build_notification(&decision, &s, "job-1", Some("/tmp/r.json"));
        assert_eq!(notification.severity, Severity::High);
        assert_eq!(notification.metadata["reportFile"], "/tmp/r.json");

        let sink = MemoryNotificationSink::with_recipient("ops@example.com");
        assert!(dispatch_alert(&sink, &notification).await);
        assert_eq!(sink.sent().len(), 1);

        assert!(!dispatch_alert(&MemoryNotificationSink::without_recipient(), &notification).await);
        let failing = MemoryNotificationSink::failing("ops@example.com");
        assert!(!dispatch_alert(&failing, &notification).await);
    }
}
