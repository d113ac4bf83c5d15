//! Postgres-backed document store: one `(id text primary key, doc jsonb)` table per collection.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tracing::{debug, info_span, Instrument};

use crate::{
    validate_collection, BulkWriteFailure, BulkWriteSummary, Document, DocumentStore,
    StoreError, UpdateOperation, UpdateTarget,
};

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    fn find_sql(collection: &str) -> String {
        format!(
            r#"
            SELECT id::text AS id,
                   (SELECT jsonb_object_agg(f.key, f.value)
                      FROM jsonb_each(d.doc) AS f
                     WHERE f.key = ANY($1)
                       AND f.value <> 'null'::jsonb) AS projected
              FROM "{collection}" d
             WHERE d.doc ?| $1
             ORDER BY d.id
             LIMIT $2
            "#
        )
    }

    fn scalar_sql(collection: &str) -> String {
        format!(
            r#"
            UPDATE "{collection}"
               SET doc = jsonb_set(doc, ARRAY[$2], to_jsonb($3::text), true)
             WHERE id::text = $1
            "#
        )
    }

    fn array_element_sql(collection: &str) -> String {
        format!(
            r#"
            UPDATE "{collection}"
               SET doc = jsonb_set(
                     doc,
                     ARRAY[$2, (
                       SELECT (e.ord - 1)::text
                         FROM jsonb_array_elements_text(doc -> $2) WITH ORDINALITY AS e(value, ord)
                        WHERE e.value = $3
                        ORDER BY e.ord
                        LIMIT 1
                     )],
                     to_jsonb($4::text),
                     false)
             WHERE id::text = $1
               AND jsonb_typeof(doc -> $2) = 'array'
               AND (doc -> $2) ? $3
            "#
        )
    }

    async fn apply_one(&self, collection: &str, op: &UpdateOperation) -> Result<u64, sqlx::Error> {
        let result = match &op.target {
            UpdateTarget::Scalar => {
                sqlx::query(&Self::scalar_sql(collection))
                    .bind(&op.document_id)
                    .bind(&op.field)
                    .bind(&op.new_value)
                    .execute(&self.pool)
                    .await?
            }
            UpdateTarget::ArrayElement { expected } => {
                sqlx::query(&Self::array_element_sql(collection))
                    .bind(&op.document_id)
                    .bind(&op.field)
                    .bind(expected)
                    .bind(&op.new_value)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn find(
        &self,
        collection: &str,
        fields: &[&str],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let field_names = fields.iter().map(|f| f.to_string()).collect::<Vec<_>>();
        let rows = sqlx::query(&Self::find_sql(collection))
            .bind(&field_names)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::Query {
                collection: collection.to_string(),
                message: err.to_string(),
            })?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let projected: Option<Value> = row.try_get("projected")?;
            let fields = match projected {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            if !fields.is_empty() {
                out.push(Document { id, fields });
            }
        }
        Ok(out)
    }

    async fn bulk_update(
        &self,
        collection: &str,
        ops: Vec<UpdateOperation>,
    ) -> Result<BulkWriteSummary, StoreError> {
        validate_collection(collection)?;
        let span = info_span!("pg_bulk_update", collection, ops = ops.len());
        async {
            let mut summary = BulkWriteSummary::default();
            for (index, op) in ops.iter().enumerate() {
                match self.apply_one(collection, op).await {
                    Ok(rows) => {
                        let rows = rows as usize;
                        summary.matched += rows;
                        summary.modified += rows;
                    }
                    Err(err) => {
                        debug!(
                            document_id = %op.document_id,
                            error = %err,
                            "bulk update operation failed"
                        );
                        summary.failures.push(BulkWriteFailure {
                            index,
                            document_id: op.document_id.clone(),
                            message: err.to_string(),
                        });
                    }
                }
            }
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_quote_the_collection() {
        assert!(PgDocumentStore::find_sql("posts").contains(r#"FROM "posts" d"#));
        assert!(PgDocumentStore::scalar_sql("users").contains(r#"UPDATE "users""#));
        let sql = PgDocumentStore::array_element_sql("records");
        assert!(sql.contains("jsonb_typeof(doc -> $2) = 'array'"));
        assert!(sql.contains("(doc -> $2) ? $3"));
    }
}
