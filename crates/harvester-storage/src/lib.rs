//! Relational store + search index contracts and their bulk adapters.
//!
//! The relational store keeps one row per harvested source record; the search
//! index only ever receives reconciled documents.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use harvester_core::{Catalog, Distribution, IndexDocument, Summary};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

pub mod elastic;
pub mod memory;
pub mod postgres;

pub use elastic::{BackoffPolicy, ElasticConfig, ElasticIndex};
pub use memory::{InMemoryIndex, InMemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "harvester-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("expected {expected} affected rows, got {actual}")]
    RowCountMismatch { expected: u64, actual: u64 },
    #[error("no open transaction")]
    NoTransaction,
    #[error("a transaction is already open")]
    TransactionOpen,
    #[error("stored row {id} could not be decoded: {source}")]
    Decode {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("bulk request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("serializing bulk body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One harvested source record, written as-is (never merged at write time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntity {
    pub identifier: String,
    pub source: String,
    pub collection_id: i32,
    pub dataset: IndexDocument,
    pub original_document: Option<String>,
}

/// A service distribution operating on the dataset whose anchor key is
/// `dataset_identifier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingEntity {
    pub dataset_identifier: String,
    pub service_id: String,
    pub service_type: String,
    pub source: String,
    pub distribution: Distribution,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketPayload {
    Dataset(Box<IndexDocument>),
    Service(Distribution),
}

/// A row of the ordered bucket read-back.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRow {
    pub anchor_id: i64,
    pub id: i64,
    pub payload: BucketPayload,
    pub service_type: Option<String>,
    pub issued: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
    /// Collection of a dataset row; services carry none.
    pub catalog_id: Option<i32>,
    pub source: String,
}

#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn begin_transaction(&self) -> Result<(), StoreError>;
    async fn commit_transaction(&self) -> Result<(), StoreError>;
    async fn rollback_transaction(&self) -> Result<(), StoreError>;

    /// Clock of the open transaction. Every row written inside it is stamped
    /// with this instant, so it is the cutoff for `delete_non_fetched_datasets`.
    async fn transaction_time(&self) -> Result<DateTime<Utc>, StoreError>;

    /// Returns the id of the catalog with this identifier, creating it when absent.
    async fn ensure_catalog(&self, catalog: &Catalog) -> Result<i32, StoreError>;
    async fn list_catalogs(&self) -> Result<Vec<(i32, Catalog)>, StoreError>;

    /// Writes an already merged batch inside the open transaction. Must fail
    /// with [`StoreError::RowCountMismatch`] when not every entity was written.
    async fn upsert_batch(&self, batch: &MergedBatch) -> Result<(), StoreError>;

    /// Marks every record of `source` last written before `cutoff` as deleted.
    async fn delete_non_fetched_datasets(
        &self,
        source: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Rows of every bucket touching `source` (all buckets when `None`),
    /// ordered by anchor id, then row id.
    fn bucket_rows<'a>(
        &'a self,
        source: Option<&'a str>,
    ) -> BoxStream<'a, Result<BucketRow, StoreError>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexOperation {
    Delete { id: String },
    Index { id: String, document: Box<IndexDocument> },
}

impl IndexOperation {
    pub fn id(&self) -> &str {
        match self {
            IndexOperation::Delete { id } | IndexOperation::Index { id, .. } => id,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, IndexOperation::Delete { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub applied: usize,
    pub failed: Vec<String>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Snapshot of the ids currently held by the index, when the engine can
    /// provide one cheaply.
    async fn indexed_ids(&self) -> Result<Option<HashSet<String>>, IndexError> {
        Ok(None)
    }

    async fn send_operations(&self, ops: &[IndexOperation]) -> Result<BulkResponse, IndexError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedBatch {
    pub records: Vec<RecordEntity>,
    pub couplings: Vec<CouplingEntity>,
}

impl MergedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.couplings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.couplings.len()
    }
}

/// Buffer of pending relational writes.
#[derive(Debug)]
pub struct RecordBulk {
    records: Vec<RecordEntity>,
    couplings: Vec<CouplingEntity>,
    max_size: usize,
}

impl RecordBulk {
    pub fn new(max_size: usize) -> Self {
        Self {
            records: Vec::new(),
            couplings: Vec::new(),
            max_size: max_size.max(1),
        }
    }

    /// Returns true once the buffer should be flushed.
    pub fn add_entity_to_bulk(&mut self, entity: RecordEntity) -> bool {
        self.records.push(entity);
        self.len() >= self.max_size
    }

    pub fn add_coupling_to_bulk(&mut self, entity: CouplingEntity) -> bool {
        self.couplings.push(entity);
        self.len() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.couplings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the buffer, collapsing entities that would hit the same unique key.
    pub fn take_merged(&mut self) -> MergedBatch {
        MergedBatch {
            records: merge_records(std::mem::take(&mut self.records)),
            couplings: merge_couplings(std::mem::take(&mut self.couplings)),
        }
    }
}

/// Collapses records sharing `(identifier, collection_id)`: the one with the
/// newer `extras.metadata.modified` keeps its dataset, ties go to the larger
/// serialized dataset. The others only fill in missing non-dataset fields.
/// First-seen order of the keys is preserved.
pub fn merge_records(records: Vec<RecordEntity>) -> Vec<RecordEntity> {
    let mut groups: Vec<Vec<RecordEntity>> = Vec::new();
    let mut seen: HashMap<(String, i32), usize> = HashMap::new();
    for record in records {
        let key = (record.identifier.clone(), record.collection_id);
        match seen.get(&key) {
            Some(&idx) => groups[idx].push(record),
            None => {
                seen.insert(key, groups.len());
                groups.push(vec![record]);
            }
        }
    }
    groups.into_iter().filter_map(merge_group).collect()
}

fn merge_group(group: Vec<RecordEntity>) -> Option<RecordEntity> {
    let original_document = group.iter().filter_map(|r| r.original_document.clone()).max();
    let source = group.iter().map(|r| r.source.clone()).max().unwrap_or_default();
    let mut winner = group.into_iter().max_by_key(|r| {
        (
            r.dataset.extras.metadata.modified,
            serde_json::to_string(&r.dataset).unwrap_or_default(),
            r.original_document.clone(),
            r.source.clone(),
        )
    })?;
    if winner.original_document.is_none() {
        winner.original_document = original_document;
    }
    if winner.source.is_empty() {
        winner.source = source;
    }
    Some(winner)
}

/// Collapses couplings sharing `(dataset_identifier, service_id)`, keeping the
/// longer distribution title.
pub fn merge_couplings(couplings: Vec<CouplingEntity>) -> Vec<CouplingEntity> {
    let mut out: Vec<CouplingEntity> = Vec::with_capacity(couplings.len());
    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    for coupling in couplings {
        let key = (coupling.dataset_identifier.clone(), coupling.service_id.clone());
        match seen.get(&key) {
            None => {
                seen.insert(key, out.len());
                out.push(coupling);
            }
            Some(&idx) => out[idx].distribution.absorb(coupling.distribution),
        }
    }
    out
}

/// Flushes the relational buffer. On failure the transaction is rolled back
/// and the error is recorded on `summary`; nothing is returned to the caller.
pub async fn send_bulk_data(
    store: &dyn DatasetStore,
    bulk: &mut RecordBulk,
    summary: &mut Summary,
) -> bool {
    let batch = bulk.take_merged();
    if batch.is_empty() {
        return true;
    }
    match store.upsert_batch(&batch).await {
        Ok(()) => {
            info!(rows = batch.len(), source = %summary.source_id, "bulk written");
            true
        }
        Err(err) => {
            error!(error = %err, source = %summary.source_id, "bulk write failed; rolling back");
            summary.database_error(err.to_string());
            if let Err(rollback_err) = store.rollback_transaction().await {
                summary.database_error(format!("rollback failed: {rollback_err}"));
            }
            false
        }
    }
}

/// Buffer of pending search-index operations, flushed at a fixed size.
#[derive(Debug)]
pub struct IndexBulk {
    ops: Vec<IndexOperation>,
    max_size: usize,
}

impl IndexBulk {
    pub fn new(max_size: usize) -> Self {
        Self {
            ops: Vec::new(),
            max_size: max_size.max(1),
        }
    }

    /// Appends one bucket's operations; returns true once a flush is due.
    pub fn add_operation_chunks_to_bulk(&mut self, ops: Vec<IndexOperation>) -> bool {
        self.ops.extend(ops);
        self.ops.len() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drops buffered operations without sending them (dry runs).
    pub fn discard(&mut self) -> usize {
        let n = self.ops.len();
        self.ops.clear();
        n
    }

    pub async fn send_bulk_operations(&mut self, index: &dyn SearchIndex, summary: &mut Summary) -> usize {
        if self.ops.is_empty() {
            return 0;
        }
        let ops = std::mem::take(&mut self.ops);
        match index.send_operations(&ops).await {
            Ok(response) => {
                for failure in response.failed {
                    summary.elastic_error(failure);
                }
                response.applied
            }
            Err(err) => {
                error!(error = %err, ops = ops.len(), "bulk index request failed");
                summary.elastic_error(err.to_string());
                0
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn newer_record_wins_and_keeps_original_from_older() {
        let older = record("plan-1", 8, Some("<xml/>"));
        let mut newer = record("plan-1", 10, None);
        newer.dataset.title = "Updated".into();
        let merged = merge_records(vec![older, newer]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].dataset.title, "Updated");
        assert_eq!(merged[0].original_document.as_deref(), Some("<xml/>"));
    }

    #[test]
    fn merge_result_does_not_depend_on_arrival_order() {
        let a = record("plan-1", 8, None);
        let mut b = record("plan-1", 12, Some("<b/>"));
        b.dataset.title = "Newest".into();
        let one = merge_records(vec![a.clone(), b.clone()]);
        let two = merge_records(vec![b, a]);
        assert_eq!(one, two);
    }

    #[test]
    fn equal_modified_dates_merge_the_same_way_in_any_order() {
        let a = record("plan-1", 8, None);
        let mut b = record("plan-1", 8, Some("<b/>"));
        b.dataset.title = "Other title".into();
        let mut c = record("plan-1", 8, None);
        c.source = String::new();
        let one = merge_records(vec![a.clone(), b.clone(), c.clone()]);
        let two = merge_records(vec![b.clone(), c.clone(), a.clone()]);
        let three = merge_records(vec![c, a, b]);
        assert_eq!(one.len(), 1);
        assert_eq!(one, two);
        assert_eq!(two, three);
        assert_eq!(one[0].original_document.as_deref(), Some("<b/>"));
    }

    #[test]
    fn distinct_collections_are_not_merged() {
        let a = record("plan-1", 8, None);
        let mut b = record("plan-1", 9, None);
        b.collection_id = 2;
        assert_eq!(merge_records(vec![a, b]).len(), 2);
    }

    #[test]
    fn couplings_keep_longer_title() {
        let mut short = Distribution::new("https://example.org/wfs");
        short.title = Some("WFS".into());
        let mut long = short.clone();
        long.title = Some("WFS Bebauungspläne Hamburg".into());
        let mk = |d: Distribution| CouplingEntity {
            dataset_identifier: "plan-1".into(),
            service_id: "svc".into(),
            service_type: "wfs".into(),
            source: "wfs-hh".into(),
            distribution: d,
        };
        let merged = merge_couplings(vec![mk(short), mk(long)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].distribution.title.as_deref(), Some("WFS Bebauungspläne Hamburg"));
    }

    #[test]
    fn bulk_reports_flush_threshold() {
        let mut bulk = RecordBulk::new(2);
        assert!(!bulk.add_entity_to_bulk(record("a", 1, None)));
        assert!(bulk.add_entity_to_bulk(record("b", 1, None)));
        let batch = bulk.take_merged();
        assert_eq!(batch.len(), 2);
        assert!(bulk.is_empty());
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_records_error() {
        let store = InMemoryStore::new();
        store.begin_transaction().await.unwrap();
        store.fail_writes(true);
        let mut bulk = RecordBulk::new(10);
        bulk.add_entity_to_bulk(record("a", 1, None));
        let mut summary = Summary::new("csw-hh");
        let ok = send_bulk_data(&store, &mut bulk, &mut summary).await;
        assert!(!ok);
        assert!(summary.is_failed());
        assert_eq!(summary.database_errors.len(), 1);
        assert!(matches!(
            store.commit_transaction().await,
            Err(StoreError::NoTransaction)
        ));
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn index_bulk_flushes_and_records_item_failures() {
        let index = InMemoryIndex::new();
        index.reject_id("bad");
        let mut bulk = IndexBulk::new(2);
        let doc = document("ok", 1);
        assert!(!bulk.add_operation_chunks_to_bulk(vec![IndexOperation::Index {
            id: "hh/ok".into(),
            document: Box::new(doc.clone()),
        }]));
        assert!(bulk.add_operation_chunks_to_bulk(vec![IndexOperation::Index {
            id: "bad".into(),
            document: Box::new(doc),
        }]));
        let mut summary = Summary::new("reconcile");
        let applied = bulk.send_bulk_operations(&index, &mut summary).await;
        assert_eq!(applied, 1);
        assert_eq!(summary.elastic_errors.len(), 1);
        assert!(bulk.is_empty());
    }
}
