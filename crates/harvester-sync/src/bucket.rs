//! Groups the ordered bucket read-back into one [`Bucket`] per anchor id.

use std::collections::{BTreeMap, HashMap};

use harvester_core::{Catalog, Distribution, IndexDocument};
use harvester_storage::{BucketPayload, BucketRow};
use tracing::debug;

/// Records and service distributions sharing one anchor id. Keys are store
/// row ids, so iteration follows first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    pub anchor_id: i64,
    pub duplicates: BTreeMap<i64, IndexDocument>,
    pub operating_services: BTreeMap<i64, Distribution>,
    /// Canonical ids of records the store has marked deleted.
    pub retired: Vec<String>,
}

impl Bucket {
    fn new(anchor_id: i64) -> Self {
        Self {
            anchor_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.duplicates.is_empty() && self.operating_services.is_empty() && self.retired.is_empty()
    }
}

/// Read-only snapshot of every catalog, loaded once per reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct CatalogCache {
    catalogs: HashMap<i32, Catalog>,
}

impl CatalogCache {
    pub fn new(catalogs: impl IntoIterator<Item = (i32, Catalog)>) -> Self {
        Self {
            catalogs: catalogs.into_iter().collect(),
        }
    }

    pub fn get(&self, id: i32) -> Option<&Catalog> {
        self.catalogs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }
}

/// Consumes rows ordered by anchor id and yields each bucket once its last
/// row has been seen.
#[derive(Debug)]
pub struct BucketAssembler {
    catalogs: CatalogCache,
    current: Option<Bucket>,
}

impl BucketAssembler {
    pub fn new(catalogs: CatalogCache) -> Self {
        Self {
            catalogs,
            current: None,
        }
    }

    /// Adds a row; returns the previous bucket when `row` starts a new one.
    pub fn push(&mut self, row: BucketRow) -> Option<Bucket> {
        let finished = match &self.current {
            Some(bucket) if bucket.anchor_id != row.anchor_id => self.current.take(),
            _ => None,
        };
        let bucket = self.current.get_or_insert_with(|| Bucket::new(row.anchor_id));
        match row.payload {
            BucketPayload::Dataset(mut document) => {
                if let Some(catalog) = row.catalog_id.and_then(|id| self.catalogs.get(id)) {
                    document.catalog = catalog.clone();
                }
                if row.deleted.is_some() {
                    bucket.retired.push(document.canonical_id());
                } else {
                    bucket.duplicates.insert(row.id, *document);
                }
            }
            BucketPayload::Service(distribution) => {
                if row.deleted.is_none() {
                    bucket.operating_services.insert(row.id, distribution);
                } else {
                    debug!(id = row.id, "skipping deleted service row");
                }
            }
        }
        finished
    }

    pub fn finish(&mut self) -> Option<Bucket> {
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::test_support::document;

    fn row(anchor_id: i64, id: i64, payload: BucketPayload) -> BucketRow {
        BucketRow {
            anchor_id,
            id,
            payload,
            service_type: None,
            issued: None,
            modified: None,
            deleted: None,
            catalog_id: Some(1),
            source: "csw-hh".into(),
        }
    }

    fn dataset(identifier: &str) -> BucketPayload {
        BucketPayload::Dataset(Box::new(document(identifier, "csw")))
    }

    #[test]
    fn buckets_close_when_the_anchor_changes() {
        let mut assembler = BucketAssembler::new(CatalogCache::default());
        assert!(assembler.push(row(1, 1, dataset("a"))).is_none());
        assert!(assembler
            .push(row(1, 2, BucketPayload::Service(Distribution::new("https://x.org/wfs"))))
            .is_none());
        let first = assembler.push(row(3, 3, dataset("c"))).unwrap();
        assert_eq!(first.anchor_id, 1);
        assert_eq!(first.duplicates.len(), 1);
        assert_eq!(first.operating_services.len(), 1);
        let last = assembler.finish().unwrap();
        assert_eq!(last.anchor_id, 3);
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn catalogs_are_refreshed_and_deleted_rows_retired() {
        let catalog = Catalog {
            identifier: "hh".into(),
            title: "Hamburg (neu)".into(),
            ..Default::default()
        };
        let mut assembler = BucketAssembler::new(CatalogCache::new([(1, catalog.clone())]));
        let mut gone = row(1, 2, dataset("b"));
        gone.deleted = Some(Utc::now());
        assembler.push(row(1, 1, dataset("a")));
        assembler.push(gone);
        let bucket = assembler.finish().unwrap();
        assert_eq!(bucket.duplicates[&1].catalog, catalog);
        assert_eq!(bucket.retired, vec!["hh/b".to_string()]);
    }
}
