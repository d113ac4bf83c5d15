//! Metrics and notification collaborators.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub const CANDIDATES_COUNTER: &str = "image_url_governance_candidates_total";
pub const REMAINING_GAUGE: &str = "image_url_governance_remaining";
pub const ADMIN_ROLE: &str = "admin";

pub type Labels = Vec<(&'static str, String)>;

#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &Labels, value: u64);
    fn set_gauge(&self, name: &str, labels: &Labels, value: f64);
    /// Last value of every label set recorded for gauge `name`.
    fn gauge_snapshot(&self, name: &str) -> Vec<GaugeSample>;
}

type SeriesKey = (String, Vec<(String, String)>);

fn series_key(name: &str, labels: &Labels) -> SeriesKey {
    let mut pairs = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect::<Vec<_>>();
    pairs.sort();
    (name.to_string(), pairs)
}

fn facade_labels(labels: &Labels) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(k, v)| metrics::Label::new(*k, v.clone()))
        .collect()
}

/// Forwards to the `metrics` facade and keeps the latest values in memory so the
/// analytics reader can take a gauge snapshot.
#[derive(Debug, Default)]
pub struct GovernanceMetrics {
    counters: Mutex<BTreeMap<SeriesKey, u64>>,
    gauges: Mutex<BTreeMap<SeriesKey, f64>>,
}

impl GovernanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str, labels: &Labels) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters.get(&series_key(name, labels)).copied().unwrap_or(0)
    }

    pub fn counter_total(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }
}

impl MetricsSink for GovernanceMetrics {
    fn increment_counter(&self, name: &str, labels: &Labels, value: u64) {
        metrics::counter!(name.to_string(), facade_labels(labels)).increment(value);
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        *counters.entry(series_key(name, labels)).or_default() += value;
    }

    fn set_gauge(&self, name: &str, labels: &Labels, value: f64) {
        metrics::gauge!(name.to_string(), facade_labels(labels)).set(value);
        let mut gauges = self.gauges.lock().unwrap_or_else(|p| p.into_inner());
        gauges.insert(series_key(name, labels), value);
    }

    fn gauge_snapshot(&self, name: &str) -> Vec<GaugeSample> {
        let gauges = self.gauges.lock().unwrap_or_else(|p| p.into_inner());
        gauges
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|((_, labels), value)| GaugeSample {
                labels: labels.iter().cloned().collect(),
                value: *value,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotification {
    pub recipient_role: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Concrete recipient for a role, or `None` when nobody holds it.
    async fn resolve_recipient(&self, role: &str) -> Option<String>;

    async fn send(
        &self,
        recipient: &str,
        notification: &AlertNotification,
    ) -> Result<(), NotifyError>;
}

/// Emits alerts as structured log events addressed to a configured admin.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationSink {
    admin_recipient: Option<String>,
}

impl LogNotificationSink {
    pub fn new(admin_recipient: Option<String>) -> Self {
        Self { admin_recipient }
    }
}

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn resolve_recipient(&self, role: &str) -> Option<String> {
        (role == ADMIN_ROLE)
            .then(|| self.admin_recipient.clone())
            .flatten()
    }

    async fn send(
        &self,
        recipient: &str,
        notification: &AlertNotification,
    ) -> Result<(), NotifyError> {
        warn!(
            recipient,
            severity = ?notification.severity,
            title = %notification.title,
            metadata = %notification.metadata,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Collects notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    recipient: Option<String>,
    fail_sends: bool,
    sent: Mutex<Vec<(String, AlertNotification)>>,
}

impl MemoryNotificationSink {
    pub fn with_recipient(recipient: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient.into()),
            ..Self::default()
        }
    }

    pub fn without_recipient() -> Self {
        Self::default()
    }

    pub fn failing(recipient: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient.into()),
            fail_sends: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, AlertNotification)> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn resolve_recipient(&self, role: &str) -> Option<String> {
        (role == ADMIN_ROLE).then(|| self.recipient.clone()).flatten()
    }

    async fn send(
        &self,
        recipient: &str,
        notification: &AlertNotification,
    ) -> Result<(), NotifyError> {
        if self.fail_sends {
            return Err(NotifyError::Transport("sink configured to fail".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((recipient.to_string(), notification.clone()));
        Ok(())
    }
}
