//! Core domain model for image URL governance.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod normalize;

pub use normalize::{normalize, KNOWN_UPLOAD_DIRS};

pub const CRATE_NAME: &str = "igov-core";

/// Classification tag explaining why/how a URL was rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    None,
    Invalid,
    PortRewrite,
    ProtocolNormalized,
    RelativeToAbsolute,
    UploadsPrefixAdded,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 6] = [
        ReasonCode::None,
        ReasonCode::Invalid,
        ReasonCode::PortRewrite,
        ReasonCode::ProtocolNormalized,
        ReasonCode::RelativeToAbsolute,
        ReasonCode::UploadsPrefixAdded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::None => "none",
            ReasonCode::Invalid => "invalid",
            ReasonCode::PortRewrite => "port_rewrite",
            ReasonCode::ProtocolNormalized => "protocol_normalized",
            ReasonCode::RelativeToAbsolute => "relative_to_absolute",
            ReasonCode::UploadsPrefixAdded => "uploads_prefix_added",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One URL-bearing field occurrence. Array slots use a `field[]` path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReference {
    pub entity_kind: String,
    pub document_id: String,
    pub field_path: String,
    pub original_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationOutcome {
    pub resolved_value: String,
    pub reason_code: ReasonCode,
    pub changed: bool,
}

impl NormalizationOutcome {
    pub fn unchanged(raw: &str, reason_code: ReasonCode) -> Self {
        Self {
            resolved_value: raw.to_string(),
            reason_code,
            changed: false,
        }
    }

    /// Builds an outcome for a rewrite, keeping `changed` tied to actual inequality.
    pub fn rewritten(raw: &str, resolved_value: String, reason_code: ReasonCode) -> Self {
        if resolved_value == raw {
            return Self::unchanged(raw, ReasonCode::None);
        }
        Self {
            resolved_value,
            reason_code,
            changed: true,
        }
    }
}

/// A single document field whose raw value differs from its normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(flatten)]
    pub reference: RawReference,
    #[serde(flatten)]
    pub outcome: NormalizationOutcome,
}

impl Candidate {
    /// Returns `None` when the outcome is not a change; only changes are candidates.
    pub fn from_outcome(reference: RawReference, outcome: NormalizationOutcome) -> Option<Self> {
        outcome.changed.then_some(Self { reference, outcome })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSummary {
    pub total_candidates: usize,
    pub by_entity_kind: BTreeMap<String, usize>,
    pub by_reason: BTreeMap<String, usize>,
}

impl PreviewSummary {
    pub fn record(&mut self, candidate: &Candidate) {
        self.total_candidates += 1;
        *self
            .by_entity_kind
            .entry(candidate.reference.entity_kind.clone())
            .or_default() += 1;
        *self
            .by_reason
            .entry(candidate.outcome.reason_code.as_str().to_string())
            .or_default() += 1;
    }

    pub fn reason_count(&self, reason: ReasonCode) -> usize {
        self.by_reason.get(reason.as_str()).copied().unwrap_or(0)
    }

    /// `totalCandidates == sum(byEntityKind) == sum(byReason)`.
    pub fn is_consistent(&self) -> bool {
        let by_kind: usize = self.by_entity_kind.values().sum();
        let by_reason: usize = self.by_reason.values().sum();
        by_kind == self.total_candidates && by_reason == self.total_candidates
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub summary: PreviewSummary,
    pub sample_changes: Vec<Candidate>,
    /// Entity kinds whose query failed during the scan.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_entity_kinds: Vec<String>,
}

impl PreviewResult {
    /// Assembles a result from candidates, deriving the summary from them.
    pub fn from_candidates(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        candidates: Vec<Candidate>,
    ) -> Self {
        let mut summary = PreviewSummary::default();
        for candidate in &candidates {
            summary.record(candidate);
        }
        Self {
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            summary,
            sample_changes: candidates,
            skipped_entity_kinds: Vec::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.summary.is_consistent() && self.summary.total_candidates == self.sample_changes.len()
    }
}

/// Immutable preview held by the job store until executed or expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewJob {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub result: PreviewResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub entity_kind: String,
    pub document_id: String,
    pub field_path: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub job_id: String,
    #[serde(flatten)]
    pub preview: PreviewResult,
    pub updated_count: usize,
    pub failed_count: usize,
    pub failures: Vec<FailureRecord>,
    pub report_file: Option<String>,
    pub model_durations_ms: BTreeMap<String, u64>,
    /// Always false: the remaining gauge is set to 0 rather than computed.
    pub remaining_computed: bool,
    pub report_persisted: bool,
    pub alert_dispatched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Applied exactly the candidates of the requested preview.
    Executed,
    /// The requested job was missing; a fresh scan was stored and applied instead.
    Rescanned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub kind: ExecutionKind,
    pub requested_job_id: Option<String>,
    pub job_id: String,
    pub result: ExecutionResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(kind: &str, id: &str, reason: ReasonCode) -> Candidate {
        Candidate {
            reference: RawReference {
                entity_kind: kind.into(),
                document_id: id.into(),
                field_path: "avatar".into(),
                original_value: "pic.jpg".into(),
            },
            outcome: NormalizationOutcome {
                resolved_value: "http://localhost:5000/uploads/avatars/pic.jpg".into(),
                reason_code: reason,
                changed: true,
            },
        }
    }

    #[test]
    fn summary_counts_match_sample_changes() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).single().unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 2).single().unwrap();
        let result = PreviewResult::from_candidates(
            t0,
            t1,
            vec![
                candidate("user", "u1", ReasonCode::UploadsPrefixAdded),
                candidate("user", "u2", ReasonCode::PortRewrite),
                candidate("post", "p1", ReasonCode::UploadsPrefixAdded),
            ],
        );
        assert!(result.is_consistent());
        assert_eq!(result.duration_ms, 2000);
        assert_eq!(result.summary.by_entity_kind["user"], 2);
        assert_eq!(result.summary.reason_count(ReasonCode::UploadsPrefixAdded), 2);
        assert_eq!(result.summary.reason_count(ReasonCode::Invalid), 0);
    }

    #[test]
    fn unchanged_outcomes_are_not_candidates() {
        let reference = RawReference {
            entity_kind: "pet".into(),
            document_id: "p1".into(),
            field_path: "avatar".into(),
            original_value: "https://cdn.example.com/x.png".into(),
        };
        let outcome =
            NormalizationOutcome::unchanged("https://cdn.example.com/x.png", ReasonCode::None);
        assert!(Candidate::from_outcome(reference, outcome).is_none());
    }

    #[test]
    fn candidate_serializes_flat_camel_case() {
        let value = serde_json::to_value(candidate("user", "u1", ReasonCode::PortRewrite)).unwrap();
        assert_eq!(value["entityKind"], "user");
        assert_eq!(value["reasonCode"], "port_rewrite");
        assert_eq!(value["changed"], true);
    }
}
