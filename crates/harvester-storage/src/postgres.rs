//! Postgres-backed [`DatasetStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use harvester_core::{Agent, Catalog, Distribution, IndexDocument};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::info;

use crate::{BucketPayload, BucketRow, DatasetStore, MergedBatch, StoreError};

const BUCKET_ROWS_SQL: &str = r#"
WITH entities AS (
    SELECT r.id,
           r.anchor_key,
           'dataset' AS kind,
           r.dataset AS payload,
           NULL::text AS service_type,
           r.collection_id,
           r.source,
           r.deleted_on
      FROM record r
    UNION ALL
    SELECT c.id,
           lower(c.dataset_identifier),
           'service',
           c.distribution,
           c.service_type,
           NULL::integer,
           c.source,
           c.deleted_on
      FROM coupling c
), anchored AS (
    SELECT e.*,
           min(e.id) OVER (PARTITION BY e.anchor_key) AS anchor_id,
           bool_or($1::text IS NULL OR e.source = $1) OVER (PARTITION BY e.anchor_key) AS touched
      FROM entities e
)
SELECT anchor_id, id, kind, payload, service_type, collection_id, source, deleted_on
  FROM anchored
 WHERE touched
 ORDER BY anchor_id, id
"#;

pub struct PgStore {
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            tx: Mutex::new(None),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl DatasetStore for PgStore {
    async fn begin_transaction(&self) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        if guard.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        *guard = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), StoreError> {
        let tx = self.tx.lock().await.take().ok_or(StoreError::NoTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<(), StoreError> {
        let tx = self.tx.lock().await.take().ok_or(StoreError::NoTransaction)?;
        tx.rollback().await?;
        Ok(())
    }

    async fn transaction_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::NoTransaction)?;
        // now() is fixed at transaction start and is what the upserts stamp
        let started: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut **tx)
            .await?;
        Ok(started)
    }

    async fn ensure_catalog(&self, catalog: &Catalog) -> Result<i32, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO catalog (identifier, title, description, publisher, homepage)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (identifier) DO UPDATE
               SET title = EXCLUDED.title,
                   description = EXCLUDED.description,
                   publisher = EXCLUDED.publisher,
                   homepage = EXCLUDED.homepage
            RETURNING id
            "#,
        )
        .bind(&catalog.identifier)
        .bind(&catalog.title)
        .bind(&catalog.description)
        .bind(catalog.publisher.as_ref().map(Json))
        .bind(&catalog.homepage)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn list_catalogs(&self) -> Result<Vec<(i32, Catalog)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, identifier, title, description, publisher, homepage
              FROM catalog
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let publisher: Option<Json<Agent>> = row.try_get("publisher")?;
            out.push((
                row.try_get("id")?,
                Catalog {
                    identifier: row.try_get("identifier")?,
                    title: row.try_get("title")?,
                    description: row.try_get("description")?,
                    publisher: publisher.map(|p| p.0),
                    homepage: row.try_get("homepage")?,
                },
            ));
        }
        Ok(out)
    }

    async fn upsert_batch(&self, batch: &MergedBatch) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::NoTransaction)?;
        let mut affected = 0u64;

        for record in &batch.records {
            affected += sqlx::query(
                r#"
                INSERT INTO record (identifier, source, collection_id, anchor_key, dataset, original_document)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (identifier, collection_id) DO UPDATE
                   SET source = EXCLUDED.source,
                       anchor_key = EXCLUDED.anchor_key,
                       dataset = EXCLUDED.dataset,
                       original_document = EXCLUDED.original_document,
                       last_modified = NOW(),
                       deleted_on = NULL
                "#,
            )
            .bind(&record.identifier)
            .bind(&record.source)
            .bind(record.collection_id)
            .bind(record.dataset.anchor_key())
            .bind(Json(&record.dataset))
            .bind(&record.original_document)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        }

        for coupling in &batch.couplings {
            affected += sqlx::query(
                r#"
                INSERT INTO coupling (dataset_identifier, service_id, service_type, source, distribution)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (dataset_identifier, service_id) DO UPDATE
                   SET service_type = EXCLUDED.service_type,
                       source = EXCLUDED.source,
                       distribution = EXCLUDED.distribution,
                       last_modified = NOW(),
                       deleted_on = NULL
                "#,
            )
            .bind(&coupling.dataset_identifier)
            .bind(&coupling.service_id)
            .bind(&coupling.service_type)
            .bind(&coupling.source)
            .bind(Json(&coupling.distribution))
            .execute(&mut **tx)
            .await?
            .rows_affected();
        }

        let expected = batch.len() as u64;
        if affected != expected {
            return Err(StoreError::RowCountMismatch {
                expected,
                actual: affected,
            });
        }
        Ok(())
    }

    async fn delete_non_fetched_datasets(
        &self,
        source: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::NoTransaction)?;
        let mut marked = 0u64;
        for table in ["record", "coupling"] {
            let sql = format!(
                "UPDATE {table} SET deleted_on = NOW() \
                  WHERE source = $1 AND last_modified < $2 AND deleted_on IS NULL"
            );
            marked += sqlx::query(&sql)
                .bind(source)
                .bind(cutoff)
                .execute(&mut **tx)
                .await?
                .rows_affected();
        }
        Ok(marked)
    }

    fn bucket_rows<'a>(
        &'a self,
        source: Option<&'a str>,
    ) -> BoxStream<'a, Result<BucketRow, StoreError>> {
        sqlx::query(BUCKET_ROWS_SQL)
            .bind(source)
            .fetch(&self.pool)
            .map(|row| row.map_err(StoreError::from).and_then(|row| decode_bucket_row(&row)))
            .boxed()
    }
}

fn decode_bucket_row(row: &PgRow) -> Result<BucketRow, StoreError> {
    let id: i64 = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let payload: Value = row.try_get("payload")?;
    let payload = decode_payload(id, &kind, payload)?;
    let (issued, modified) = match &payload {
        BucketPayload::Dataset(doc) => (doc.issued, doc.modified),
        BucketPayload::Service(dist) => (dist.issued, dist.modified),
    };
    Ok(BucketRow {
        anchor_id: row.try_get("anchor_id")?,
        id,
        payload,
        service_type: row.try_get("service_type")?,
        issued,
        modified,
        deleted: row.try_get("deleted_on")?,
        catalog_id: row.try_get("collection_id")?,
        source: row.try_get("source")?,
    })
}

fn decode_payload(id: i64, kind: &str, payload: Value) -> Result<BucketPayload, StoreError> {
    let decoded = if kind == "service" {
        serde_json::from_value::<Distribution>(payload).map(BucketPayload::Service)
    } else {
        serde_json::from_value::<IndexDocument>(payload).map(|d| BucketPayload::Dataset(Box::new(d)))
    };
    decoded.map_err(|source| StoreError::Decode { id, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::document;

    #[test]
    fn service_payloads_decode_as_distributions() {
        let payload = serde_json::json!({"accessURL": "https://example.org/wfs", "format": ["WFS"]});
        let decoded = decode_payload(7, "service", payload).unwrap();
        match decoded {
            BucketPayload::Service(dist) => assert!(dist.has_format("wfs")),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn dataset_payloads_round_trip_through_json() {
        let doc = document("plan-1", 4);
        let decoded = decode_payload(1, "dataset", serde_json::to_value(&doc).unwrap()).unwrap();
        assert_eq!(decoded, BucketPayload::Dataset(Box::new(doc)));
    }

    #[test]
    fn broken_payloads_report_the_row_id() {
        let err = decode_payload(42, "dataset", serde_json::json!({"title": 1})).unwrap_err();
        assert!(matches!(err, StoreError::Decode { id: 42, .. }));
    }
}
