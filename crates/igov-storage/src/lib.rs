//! Document store collaborators + report file storage for image URL governance.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

mod postgres;
mod reports;

pub use postgres::PgDocumentStore;
pub use reports::{
    execution_report_date, execution_report_name, snapshot_date, snapshot_name, suffixed_name,
    ReportEntry, ReportStore, StoredReport, EXECUTION_REPORT_PREFIX, SNAPSHOT_PREFIX,
};

pub const CRATE_NAME: &str = "igov-storage";

/// A document projected down to the requested fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTarget {
    /// Overwrite the whole field.
    Scalar,
    /// Replace the first array element equal to `expected`; no-op if none matches.
    ArrayElement { expected: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOperation {
    pub document_id: String,
    pub field: String,
    pub new_value: String,
    pub target: UpdateTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteFailure {
    pub index: usize,
    pub document_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    pub matched: usize,
    pub modified: usize,
    pub failures: Vec<BulkWriteFailure>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid collection name {0:?}")]
    InvalidCollection(String),
    #[error("query against {collection} failed: {message}")]
    Query { collection: String, message: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Narrow view of the business-entity database used by the governance pipeline.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Whether scheduled governance scans may run against this backend.
    fn supports_governance(&self) -> bool {
        true
    }

    /// Up to `limit` documents carrying at least one of `fields`, projected to those fields.
    async fn find(
        &self,
        collection: &str,
        fields: &[&str],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    /// Unordered, continue-on-error batch. Per-operation failures are reported in the
    /// summary; an `Err` means the batch as a whole could not run.
    async fn bulk_update(
        &self,
        collection: &str,
        ops: Vec<UpdateOperation>,
    ) -> Result<BulkWriteSummary, StoreError>;
}

pub(crate) fn validate_collection(collection: &str) -> Result<(), StoreError> {
    let valid = !collection.is_empty()
        && collection.len() <= 63
        && collection
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !collection.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(collection.to_string()))
    }
}

/// In-process document store keyed by collection then document id.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Map<String, Value>>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document. Non-object values are stored under `value`.
    pub async fn insert(&self, collection: &str, id: &str, doc: Value) {
        let doc = match doc {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
    }

    pub async fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| Value::Object(doc.clone()))
    }

    fn apply(doc: &mut Map<String, Value>, op: &UpdateOperation) -> Result<bool, String> {
        match &op.target {
            UpdateTarget::Scalar => {
                let new_value = Value::String(op.new_value.clone());
                let modified = doc.get(&op.field) != Some(&new_value);
                doc.insert(op.field.clone(), new_value);
                Ok(modified)
            }
            UpdateTarget::ArrayElement { expected } => match doc.get_mut(&op.field) {
                Some(Value::Array(items)) => {
                    let slot = items
                        .iter_mut()
                        .find(|item| item.as_str() == Some(expected.as_str()));
                    match slot {
                        Some(slot) => {
                            *slot = Value::String(op.new_value.clone());
                            Ok(true)
                        }
                        None => Ok(false),
                    }
                }
                Some(Value::String(current)) if *current == *expected => Err(format!(
                    "field {} is not an array; positional update rejected",
                    op.field
                )),
                _ => Ok(false),
            },
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn find(
        &self,
        collection: &str,
        fields: &[&str],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let out = docs
            .iter()
            .filter_map(|(id, doc)| {
                let projected = fields
                    .iter()
                    .filter_map(|field| {
                        doc.get(*field)
                            .filter(|v| !v.is_null())
                            .map(|v| (field.to_string(), v.clone()))
                    })
                    .collect::<Map<_, _>>();
                (!projected.is_empty()).then(|| Document {
                    id: id.clone(),
                    fields: projected,
                })
            })
            .take(limit)
            .collect();
        Ok(out)
    }

    async fn bulk_update(
        &self,
        collection: &str,
        ops: Vec<UpdateOperation>,
    ) -> Result<BulkWriteSummary, StoreError> {
        validate_collection(collection)?;
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let mut summary = BulkWriteSummary::default();

        for (index, op) in ops.iter().enumerate() {
            let Some(doc) = docs.get_mut(&op.document_id) else {
                continue;
            };
            match Self::apply(doc, op) {
                Ok(true) => {
                    summary.matched += 1;
                    summary.modified += 1;
                }
                Ok(false) => {
                    if op.target == UpdateTarget::Scalar {
                        summary.matched += 1;
                    }
                }
                Err(message) => summary.failures.push(BulkWriteFailure {
                    index,
                    document_id: op.document_id.clone(),
                    message,
                }),
            }
        }
        Ok(summary)
    }
}
