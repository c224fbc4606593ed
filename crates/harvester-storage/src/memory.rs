//! Process-local store and index, used for dry runs and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use harvester_core::{Catalog, IndexDocument};

use crate::{
    BucketPayload, BucketRow, BulkResponse, CouplingEntity, DatasetStore, IndexError,
    IndexOperation, MergedBatch, RecordEntity, SearchIndex, StoreError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct Stored<T> {
    id: i64,
    entity: T,
    last_modified: DateTime<Utc>,
    deleted_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    catalogs: Vec<(i32, Catalog)>,
    records: Vec<Stored<RecordEntity>>,
    couplings: Vec<Stored<CouplingEntity>>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    snapshot: Option<Tables>,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `upsert_batch` report a row-count mismatch.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn record_count(&self) -> usize {
        lock(&self.state).tables.records.len()
    }

    pub async fn live_records(&self) -> Vec<RecordEntity> {
        lock(&self.state)
            .tables
            .records
            .iter()
            .filter(|r| r.deleted_on.is_none())
            .map(|r| r.entity.clone())
            .collect()
    }
}

#[async_trait]
impl DatasetStore for InMemoryStore {
    async fn begin_transaction(&self) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.snapshot.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        state.snapshot = Some(state.tables.clone());
        state.started_at = Some(Utc::now());
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.started_at = None;
        state.snapshot.take().map(|_| ()).ok_or(StoreError::NoTransaction)
    }

    async fn rollback_transaction(&self) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let snapshot = state.snapshot.take().ok_or(StoreError::NoTransaction)?;
        state.tables = snapshot;
        state.started_at = None;
        Ok(())
    }

    async fn transaction_time(&self) -> Result<DateTime<Utc>, StoreError> {
        lock(&self.state).started_at.ok_or(StoreError::NoTransaction)
    }

    async fn ensure_catalog(&self, catalog: &Catalog) -> Result<i32, StoreError> {
        let mut state = lock(&self.state);
        let catalogs = &mut state.tables.catalogs;
        if let Some((id, existing)) = catalogs
            .iter_mut()
            .find(|(_, c)| c.identifier == catalog.identifier)
        {
            *existing = catalog.clone();
            return Ok(*id);
        }
        let id = catalogs.len() as i32 + 1;
        catalogs.push((id, catalog.clone()));
        Ok(id)
    }

    async fn list_catalogs(&self) -> Result<Vec<(i32, Catalog)>, StoreError> {
        Ok(lock(&self.state).tables.catalogs.clone())
    }

    async fn upsert_batch(&self, batch: &MergedBatch) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let now = state.started_at.ok_or(StoreError::NoTransaction)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::RowCountMismatch {
                expected: batch.len() as u64,
                actual: 0,
            });
        }
        let tables = &mut state.tables;
        for record in &batch.records {
            let existing = tables.records.iter().position(|r| {
                r.entity.identifier == record.identifier
                    && r.entity.collection_id == record.collection_id
            });
            match existing {
                Some(idx) => {
                    let row = &mut tables.records[idx];
                    row.entity = record.clone();
                    row.last_modified = now;
                    row.deleted_on = None;
                }
                None => {
                    let id = tables.next_id();
                    tables.records.push(Stored {
                        id,
                        entity: record.clone(),
                        last_modified: now,
                        deleted_on: None,
                    });
                }
            }
        }
        for coupling in &batch.couplings {
            let existing = tables.couplings.iter().position(|c| {
                c.entity.dataset_identifier == coupling.dataset_identifier
                    && c.entity.service_id == coupling.service_id
            });
            match existing {
                Some(idx) => {
                    let row = &mut tables.couplings[idx];
                    row.entity = coupling.clone();
                    row.last_modified = now;
                    row.deleted_on = None;
                }
                None => {
                    let id = tables.next_id();
                    tables.couplings.push(Stored {
                        id,
                        entity: coupling.clone(),
                        last_modified: now,
                        deleted_on: None,
                    });
                }
            }
        }
        Ok(())
    }

    async fn delete_non_fetched_datasets(
        &self,
        source: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = lock(&self.state);
        let now = Utc::now();
        let mut marked = 0u64;
        for row in state.tables.records.iter_mut() {
            if row.entity.source == source && row.deleted_on.is_none() && row.last_modified < cutoff {
                row.deleted_on = Some(now);
                marked += 1;
            }
        }
        for row in state.tables.couplings.iter_mut() {
            if row.entity.source == source && row.deleted_on.is_none() && row.last_modified < cutoff {
                row.deleted_on = Some(now);
                marked += 1;
            }
        }
        Ok(marked)
    }

    fn bucket_rows<'a>(
        &'a self,
        source: Option<&'a str>,
    ) -> BoxStream<'a, Result<BucketRow, StoreError>> {
        let rows = {
            let state = lock(&self.state);
            collect_bucket_rows(&state.tables, source)
        };
        stream::iter(rows.into_iter().map(Ok)).boxed()
    }
}

fn collect_bucket_rows(tables: &Tables, source: Option<&str>) -> Vec<BucketRow> {
    let mut groups: HashMap<String, Vec<BucketRow>> = HashMap::new();
    for row in &tables.records {
        let dataset = &row.entity.dataset;
        groups.entry(dataset.anchor_key()).or_default().push(BucketRow {
            anchor_id: 0,
            id: row.id,
            payload: BucketPayload::Dataset(Box::new(dataset.clone())),
            service_type: None,
            issued: dataset.issued,
            modified: dataset.modified,
            deleted: row.deleted_on,
            catalog_id: Some(row.entity.collection_id),
            source: row.entity.source.clone(),
        });
    }
    for row in &tables.couplings {
        let coupling = &row.entity;
        groups
            .entry(coupling.dataset_identifier.trim().to_lowercase())
            .or_default()
            .push(BucketRow {
                anchor_id: 0,
                id: row.id,
                payload: BucketPayload::Service(coupling.distribution.clone()),
                service_type: Some(coupling.service_type.clone()),
                issued: coupling.distribution.issued,
                modified: coupling.distribution.modified,
                deleted: row.deleted_on,
                catalog_id: None,
                source: coupling.source.clone(),
            });
    }

    let mut out = Vec::new();
    for (_, mut members) in groups {
        if let Some(source) = source {
            if !members.iter().any(|m| m.source == source) {
                continue;
            }
        }
        let anchor_id = members.iter().map(|m| m.id).min().unwrap_or_default();
        for member in members.iter_mut() {
            member.anchor_id = anchor_id;
        }
        out.extend(members);
    }
    out.sort_by_key(|row| (row.anchor_id, row.id));
    out
}

/// Search index double that keeps documents in a map and can reject ids.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    documents: Mutex<BTreeMap<String, IndexDocument>>,
    rejected: Mutex<HashSet<String>>,
    requests: Mutex<Vec<Vec<IndexOperation>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_id(&self, id: &str) {
        lock(&self.rejected).insert(id.to_string());
    }

    pub fn get(&self, id: &str) -> Option<IndexDocument> {
        lock(&self.documents).get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.documents).keys().cloned().collect()
    }

    pub fn insert(&self, id: &str, document: IndexDocument) {
        lock(&self.documents).insert(id.to_string(), document);
    }

    /// Every operation batch received so far, in arrival order.
    pub fn requests(&self) -> Vec<Vec<IndexOperation>> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn indexed_ids(&self) -> Result<Option<HashSet<String>>, IndexError> {
        Ok(Some(lock(&self.documents).keys().cloned().collect()))
    }

    async fn send_operations(&self, ops: &[IndexOperation]) -> Result<BulkResponse, IndexError> {
        lock(&self.requests).push(ops.to_vec());
        let rejected = lock(&self.rejected).clone();
        let mut documents = lock(&self.documents);
        let mut response = BulkResponse::default();
        for op in ops {
            if rejected.contains(op.id()) {
                response.failed.push(format!("{} rejected", op.id()));
                continue;
            }
            match op {
                IndexOperation::Delete { id } => {
                    documents.remove(id);
                }
                IndexOperation::Index { id, document } => {
                    documents.insert(id.clone(), document.as_ref().clone());
                }
            }
            response.applied += 1;
        }
        Ok(response)
    }
}
