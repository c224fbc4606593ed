use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use harvester_core::{IndexDocument, PlanType};
use harvester_mappers::HookRegistry;
use harvester_storage::{InMemoryIndex, InMemoryStore, IndexOperation};
use harvester_sync::reconcile::NOTE_NO_GEOMETRY;
use harvester_sync::{SourceConfig, SyncConfig, SyncPipeline};

const CSW_PRIMARY: &str = "hh/7a3b1f2e-csw-0001";
const CSW_WITHOUT_GEOMETRY: &str = "hh/7a3b1f2e-csw-0002";

struct Harness {
    pipeline: SyncPipeline,
    store: Arc<InMemoryStore>,
    index: Arc<InMemoryIndex>,
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

fn harness(dry_run: bool) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let index = Arc::new(InMemoryIndex::new());
    let config = SyncConfig {
        workspace_root: workspace_root(),
        bulk_size: 2,
        dry_run,
        ..Default::default()
    };
    Harness {
        pipeline: SyncPipeline::new(config, store.clone(), index.clone()),
        store,
        index,
    }
}

impl Harness {
    async fn source(&self, id: &str) -> SourceConfig {
        let registry = self.pipeline.load_source_registry().await.unwrap();
        registry.find(id).cloned().unwrap()
    }

    async fn import(&self, id: &str) -> harvester_core::Summary {
        let source = self.source(id).await;
        let harvest_time = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).single().unwrap();
        self.pipeline.import_source(&source, harvest_time).await.unwrap()
    }

    async fn import_hamburg(&self) {
        for id in ["csw-hh", "wfs-xplan-hh", "wfs-services-hh"] {
            let summary = self.import(id).await;
            assert!(!summary.is_failed(), "{id}: {}", summary.log_line());
        }
    }

    fn document(&self, id: &str) -> IndexDocument {
        self.index.get(id).unwrap_or_else(|| panic!("{id} not indexed; have {:?}", self.index.ids()))
    }
}

#[tokio::test]
async fn csw_wfs_and_capabilities_reconcile_into_one_document() {
    let h = harness(false);
    h.import_hamburg().await;

    let wfs_id = h
        .store
        .live_records()
        .await
        .into_iter()
        .find(|r| r.source == "wfs-xplan-hh" && r.dataset.plan_type == PlanType::BebauPlan)
        .map(|r| r.dataset.canonical_id())
        .unwrap();

    let summary = h.pipeline.reconcile(None).await.unwrap();
    assert!(!summary.is_failed(), "{}", summary.log_line());

    let doc = h.document(CSW_PRIMARY);
    assert!(doc.is_valid(), "{:?}", doc.extras.metadata.quality_notes);
    assert_eq!(doc.plan_type, PlanType::BebauPlan);
    assert!(doc.spatial.is_some());
    assert!(doc.centroid.is_some());
    assert_eq!(doc.extras.metadata.merged_from, vec![CSW_PRIMARY.to_string(), wfs_id.clone()]);
    assert!(h.index.get(&wfs_id).is_none());

    let services = doc.distributions.iter().filter(|d| d.has_format("WFS")).collect::<Vec<_>>();
    assert_eq!(services.len(), 1);
    assert!(doc.distributions.iter().all(|d| d.resolved_geometry.is_none()));

    let export = doc.extras.transformed_data.as_ref().map(|t| t.dcat_ap_plu.as_str()).unwrap();
    assert!(export.contains("Bebauungsplan Altona-Nord 12"));
    assert!(export.contains(CSW_PRIMARY));
}

#[tokio::test]
async fn documents_without_geometry_are_indexed_as_invalid() {
    let h = harness(false);
    h.import_hamburg().await;
    h.pipeline.reconcile(None).await.unwrap();

    let doc = h.document(CSW_WITHOUT_GEOMETRY);
    assert!(!doc.is_valid());
    assert!(doc.spatial.is_none());
    assert!(doc.extras.metadata.quality_notes.contains(&NOTE_NO_GEOMETRY.to_string()));
}

#[tokio::test]
async fn services_without_a_dataset_are_skipped_and_counted() {
    let h = harness(false);
    h.import_hamburg().await;
    let summary = h.pipeline.reconcile(None).await.unwrap();

    assert_eq!(summary.skipped_docs.len(), 1);
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].1.contains("no dataset record"));
    assert!(!summary.is_failed());
}

#[tokio::test]
async fn second_reconcile_pass_only_reindexes() {
    let h = harness(false);
    h.import_hamburg().await;
    h.pipeline.reconcile(None).await.unwrap();
    let first = h.document(CSW_PRIMARY);
    let requests_before = h.index.requests().len();

    h.pipeline.reconcile(None).await.unwrap();
    let second_pass = h.index.requests()[requests_before..].concat();
    assert!(second_pass.iter().all(|op| !op.is_delete()));
    assert_eq!(second_pass.len(), h.index.ids().len());
    assert_eq!(h.document(CSW_PRIMARY), first);
}

#[tokio::test]
async fn records_missing_from_a_reimport_are_deleted_from_the_index() {
    let h = harness(false);
    h.import_hamburg().await;
    h.pipeline.reconcile(None).await.unwrap();
    assert!(h.index.get(CSW_WITHOUT_GEOMETRY).is_some());

    let mut csw = h.source("csw-hh").await;
    csw.max_records = Some(1);
    let summary = h.pipeline.import_source(&csw, Utc::now()).await.unwrap();
    assert_eq!(summary.num_docs, 1);

    h.pipeline.reconcile(Some("csw-hh")).await.unwrap();
    let last = h.index.requests().concat();
    assert!(last.contains(&IndexOperation::Delete {
        id: CSW_WITHOUT_GEOMETRY.to_string()
    }));
    assert!(h.index.get(CSW_WITHOUT_GEOMETRY).is_none());
    assert!(h.index.get(CSW_PRIMARY).is_some());
}

#[tokio::test]
async fn dry_run_maps_everything_but_writes_nothing() {
    let h = harness(true);
    let report = h.pipeline.run(None).await.unwrap();

    assert!(report.dry_run);
    assert!(report.imports.iter().map(|s| s.num_docs).sum::<usize>() > 0);
    assert_eq!(h.store.record_count().await, 0);
    assert!(h.index.requests().is_empty());
}

#[tokio::test]
async fn full_run_imports_every_enabled_source() {
    let h = harness(false);
    let report = h.pipeline.run(None).await.unwrap();

    assert_eq!(report.imports.len(), 6);
    assert!(!report.is_failed());
    assert!(h.index.get(CSW_PRIMARY).is_some());
    assert!(h.index.ids().iter().any(|id| id.starts_with("be/")));
}

#[tokio::test]
async fn failed_writes_roll_back_the_import() {
    let h = harness(false);
    h.store.fail_writes(true);
    let summary = h.import("csw-hh").await;

    assert!(summary.is_failed());
    assert_eq!(summary.database_errors.len(), 1);
    assert_eq!(h.store.record_count().await, 0);
}

#[tokio::test]
async fn unregistered_hooks_are_reported_per_document() {
    let mut h = harness(false);
    h.pipeline = SyncPipeline::new(
        SyncConfig {
            workspace_root: workspace_root(),
            ..Default::default()
        },
        h.store.clone(),
        h.index.clone(),
    )
    .with_hooks(HookRegistry::empty());
    let summary = h.import("csw-hh").await;

    assert!(summary.num_docs > 0);
    assert_eq!(summary.app_errors.len(), summary.num_docs);
    assert!(summary.app_errors[0].contains("unknown hook `normalize-whitespace`"));
    assert_eq!(h.store.record_count().await, summary.num_docs);
}
