//! Candidate scanner: walks entity descriptors and collects URL rewrites.

use std::sync::Arc;

use chrono::Utc;
use igov_adapters::{EntityDescriptor, FieldShape, StrategyRegistry};
use igov_core::{normalize, Candidate, PreviewResult, RawReference, ReasonCode};
use igov_storage::DocumentStore;
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};

pub struct Scanner {
    store: Arc<dyn DocumentStore>,
    registry: Arc<StrategyRegistry>,
    canonical_origin: String,
}

#[derive(Default)]
struct ScanState {
    candidates: Vec<Candidate>,
    invalid_seen: usize,
}

impl ScanState {
    fn consider(
        &mut self,
        descriptor: &EntityDescriptor,
        document_id: &str,
        field_path: &str,
        raw: &str,
        origin: &str,
    ) {
        let outcome = normalize(raw, descriptor.default_directory, origin);
        if outcome.reason_code == ReasonCode::Invalid {
            self.invalid_seen += 1;
        }
        let reference = RawReference {
            entity_kind: descriptor.entity_kind.to_string(),
            document_id: document_id.to_string(),
            field_path: field_path.to_string(),
            original_value: raw.to_string(),
        };
        if let Some(candidate) = Candidate::from_outcome(reference, outcome) {
            self.candidates.push(candidate);
        }
    }
}

impl Scanner {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<StrategyRegistry>,
        canonical_origin: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            canonical_origin: canonical_origin.into(),
        }
    }

    /// Read-only pass over up to `limit_per_entity_kind` documents of each kind.
    ///
    /// A failed query skips that entity kind; the remaining kinds are still scanned
    /// and the partial result is returned.
    pub async fn scan(&self, limit_per_entity_kind: usize) -> PreviewResult {
        let started_at = Utc::now();
        let mut state = ScanState::default();
        let mut skipped = Vec::new();

        for descriptor in self.registry.descriptors() {
            let span = info_span!("scan_entity_kind", entity_kind = descriptor.entity_kind);
            let fields = descriptor.field_names();
            let found = self
                .store
                .find(descriptor.collection, &fields, limit_per_entity_kind)
                .instrument(span)
                .await;
            let documents = match found {
                Ok(documents) => documents,
                Err(err) => {
                    warn!(
                        entity_kind = descriptor.entity_kind,
                        error = %err,
                        "scan query failed; skipping entity kind"
                    );
                    skipped.push(descriptor.entity_kind.to_string());
                    continue;
                }
            };

            for document in &documents {
                for field in descriptor.fields {
                    let field_path = field.field_path();
                    match (field.shape, document.fields.get(field.name)) {
                        (FieldShape::Scalar, Some(Value::String(raw))) => state.consider(
                            descriptor,
                            &document.id,
                            &field_path,
                            raw,
                            &self.canonical_origin,
                        ),
                        (FieldShape::Array, Some(Value::Array(items))) => {
                            for raw in items.iter().filter_map(Value::as_str) {
                                state.consider(
                                    descriptor,
                                    &document.id,
                                    &field_path,
                                    raw,
                                    &self.canonical_origin,
                                );
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut result = PreviewResult::from_candidates(started_at, Utc::now(), state.candidates);
        result.skipped_entity_kinds = skipped;
        info!(
            candidates = result.summary.total_candidates,
            invalid_seen = state.invalid_seen,
            skipped = result.skipped_entity_kinds.len(),
            duration_ms = result.duration_ms,
            "image url scan complete"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use igov_storage::{
        BulkWriteSummary, Document, MemoryDocumentStore, StoreError, UpdateOperation,
    };
    use serde_json::json;

    const ORIGIN: &str = "http://localhost:5000";

    async fn seeded() -> Arc<MemoryDocumentStore> {
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert("users", "u1", json!({"avatar": "pic.jpg"})).await;
        store
            .insert(
                "users",
                "u2",
                json!({"avatar": "http://localhost:5000/uploads/avatars/ok.jpg"}),
            )
            .await;
        store
            .insert(
                "pets",
                "p1",
                json!({"avatar": "http://127.0.0.1:4000/uploads/avatars/cat.jpg"}),
            )
            .await;
        store
            .insert(
                "posts",
                "post1",
                json!({"images": [
                    "community/a.png",
                    "https://cdn.example.com/b.png",
                    7,
                    "/images/c.png"
                ]}),
            )
            .await;
        store.insert("records", "r1", json!({"images": []})).await;
        store
    }

    struct FailingCollection {
        inner: Arc<MemoryDocumentStore>,
        collection: &'static str,
    }

    #[async_trait]
    impl DocumentStore for FailingCollection {
        fn backend_name(&self) -> &'static str {
            "failing"
        }

        async fn find(
            &self,
            collection: &str,
            fields: &[&str],
            limit: usize,
        ) -> Result<Vec<Document>, StoreError> {
            if collection == self.collection {
                return Err(StoreError::Query {
                    collection: collection.into(),
                    message: "connection reset".into(),
                });
            }
            self.inner.find(collection, fields, limit).await
        }

        async fn bulk_update(
            &self,
            collection: &str,
            ops: Vec<UpdateOperation>,
        ) -> Result<BulkWriteSummary, StoreError> {
            self.inner.bulk_update(collection, ops).await
        }
    }

    #[tokio::test]
    async fn scan_collects_changed_references_only() {
        let scanner = Scanner::new(seeded().await, Arc::new(StrategyRegistry::default()), ORIGIN);
        let result = scanner.scan(100).await;

        assert!(result.is_consistent());
        assert_eq!(result.summary.total_candidates, 4);
        assert_eq!(result.summary.by_entity_kind["user"], 1);
        assert_eq!(result.summary.by_entity_kind["pet"], 1);
        assert_eq!(result.summary.by_entity_kind["post"], 2);
        assert_eq!(result.summary.reason_count(ReasonCode::PortRewrite), 1);
        assert_eq!(result.summary.reason_count(ReasonCode::UploadsPrefixAdded), 3);

        let post = result
            .sample_changes
            .iter()
            .find(|c| c.reference.original_value == "/images/c.png")
            .expect("legacy post image");
        assert_eq!(post.reference.field_path, "images[]");
        assert_eq!(post.outcome.resolved_value, "http://localhost:5000/uploads/community/c.png");
    }

    #[tokio::test]
    async fn limit_applies_per_entity_kind() {
        let store = Arc::new(MemoryDocumentStore::new());
        for i in 0..5 {
            store.insert("users", &format!("u{i}"), json!({"avatar": "a.png"})).await;
            store.insert("pets", &format!("p{i}"), json!({"avatar": "b.png"})).await;
        }
        let scanner = Scanner::new(store, Arc::new(StrategyRegistry::default()), ORIGIN);
        let result = scanner.scan(2).await;
        assert_eq!(result.summary.by_entity_kind["user"], 2);
        assert_eq!(result.summary.by_entity_kind["pet"], 2);
    }

    #[tokio::test]
    async fn failed_entity_kind_is_skipped() {
        let store = Arc::new(FailingCollection {
            inner: seeded().await,
            collection: "pets",
        });
        let scanner = Scanner::new(store, Arc::new(StrategyRegistry::default()), ORIGIN);
        let result = scanner.scan(100).await;

        assert!(result.is_consistent());
        assert_eq!(result.skipped_entity_kinds, vec!["pet".to_string()]);
        assert!(!result.summary.by_entity_kind.contains_key("pet"));
        assert_eq!(result.summary.total_candidates, 3);
    }
}
