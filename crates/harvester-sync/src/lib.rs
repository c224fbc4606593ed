//! Harvest orchestration: source registry, import pass and reconcile pass.

pub mod bucket;
pub mod export;
pub mod reconcile;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use harvester_core::{Catalog, SourceType, Summary};
use harvester_mappers::{map_source, HookRegistry, IndexDocumentFactory, MapperKind, MapperSettings};
use harvester_storage::{
    send_bulk_data, CouplingEntity, DatasetStore, ElasticConfig, ElasticIndex, InMemoryIndex,
    InMemoryStore, IndexBulk, PgStore, RecordBulk, RecordEntity, SearchIndex,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use bucket::{Bucket, BucketAssembler, CatalogCache};
pub use reconcile::{ReconcileError, Reconciler};

pub const CRATE_NAME: &str = "harvester-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: MapperKind,
    /// Overrides the tag implied by `kind`, e.g. a DCAT-AP.PLU feed that is
    /// really delivered by the cockpit system.
    #[serde(default)]
    pub source_type: Option<SourceType>,
    pub catalog: Catalog,
    /// Raw payload delivered by the transport layer, relative to the workspace.
    pub input: PathBuf,
    #[serde(default)]
    pub source_base: String,
    #[serde(default)]
    pub portal_link: Option<String>,
    #[serde(default)]
    pub attribution: Option<String>,
    #[serde(default)]
    pub custom_hooks: Vec<String>,
    #[serde(default)]
    pub max_records: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn mapper_settings(&self) -> MapperSettings {
        let mut settings = MapperSettings::new(self.source_id.clone(), self.kind, self.catalog.clone());
        if let Some(source_type) = &self.source_type {
            settings.source_type = source_type.clone();
        }
        settings.source_base = self.source_base.clone();
        settings.portal_link = self.portal_link.clone();
        settings.attribution = self.attribution.clone();
        settings.custom_hooks = self.custom_hooks.clone();
        settings.max_records = self.max_records;
        settings
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub elastic_url: Option<String>,
    pub elastic_index: String,
    pub bulk_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub workspace_root: PathBuf,
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            elastic_url: None,
            elastic_index: "plu".to_string(),
            bulk_size: 100,
            http_timeout_secs: 20,
            user_agent: "plu-harvester/0.1".to_string(),
            workspace_root: PathBuf::from("."),
            dry_run: false,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: non_empty_var("DATABASE_URL"),
            elastic_url: non_empty_var("ELASTIC_URL"),
            elastic_index: non_empty_var("ELASTIC_INDEX").unwrap_or(defaults.elastic_index),
            bulk_size: non_empty_var("HARVESTER_BULK_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bulk_size),
            http_timeout_secs: non_empty_var("HARVESTER_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: non_empty_var("HARVESTER_USER_AGENT").unwrap_or(defaults.user_agent),
            workspace_root: non_empty_var("HARVESTER_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            dry_run: non_empty_var("HARVESTER_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn elastic_config(&self) -> Option<ElasticConfig> {
        self.elastic_url.as_ref().map(|url| ElasticConfig {
            url: url.clone(),
            index: self.elastic_index.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })
    }
}

/// Outcome of one `run`: a summary per imported source plus the reconcile pass.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub imports: Vec<Summary>,
    pub reconcile: Summary,
}

impl RunReport {
    pub fn is_failed(&self) -> bool {
        self.reconcile.is_failed() || self.imports.iter().any(Summary::is_failed)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn DatasetStore>,
    index: Arc<dyn SearchIndex>,
    hooks: HookRegistry,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn DatasetStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            config,
            store,
            index,
            hooks: HookRegistry::builtin(),
        }
    }

    /// Postgres and Elasticsearch when configured, in-memory engines otherwise.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store: Arc<dyn DatasetStore> = match &config.database_url {
            Some(url) => {
                let store = PgStore::connect(url).await.context("connecting to postgres")?;
                store.migrate().await.context("running migrations")?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; using the in-memory store");
                Arc::new(InMemoryStore::new())
            }
        };
        let index: Arc<dyn SearchIndex> = match config.elastic_config() {
            Some(elastic) => Arc::new(ElasticIndex::new(elastic).context("building elasticsearch client")?),
            None => {
                warn!("ELASTIC_URL not set; using the in-memory index");
                Arc::new(InMemoryIndex::new())
            }
        };
        Ok(Self::new(config, store, index))
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn rollback(&self, summary: &mut Summary) {
        if let Err(err) = self.store.rollback_transaction().await {
            summary.database_error(format!("rollback failed: {err}"));
        }
    }

    /// Maps one source into the relational store inside a single transaction.
    /// Store failures roll back and end up on the returned summary.
    pub async fn import_source(&self, source: &SourceConfig, harvest_time: DateTime<Utc>) -> Result<Summary> {
        let span = info_span!("import", source = %source.source_id, dry_run = self.config.dry_run);
        async move {
            let mut summary = Summary::new(&source.source_id);
            let settings = source.mapper_settings();
            let path = self.config.workspace_root.join(&source.input);
            let raw = match fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "source input unreadable");
                    summary.app_error(format!("reading {}: {err}", path.display()));
                    return Ok(summary);
                }
            };

            if let Err(err) = self.store.begin_transaction().await {
                summary.database_error(err.to_string());
                return Ok(summary);
            }
            // the store stamps every row of this transaction with its own clock
            let cutoff = match self.store.transaction_time().await {
                Ok(cutoff) => cutoff,
                Err(err) => {
                    summary.database_error(err.to_string());
                    self.rollback(&mut summary).await;
                    return Ok(summary);
                }
            };
            let collection_id = match self.store.ensure_catalog(&settings.catalog).await {
                Ok(id) => id,
                Err(err) => {
                    summary.database_error(err.to_string());
                    self.rollback(&mut summary).await;
                    return Ok(summary);
                }
            };

            let mut factory = IndexDocumentFactory::new(self.hooks.clone());
            let records = match map_source(&raw, &settings, &mut factory, harvest_time, &mut summary) {
                Ok(records) => records,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "source payload rejected");
                    summary.app_error(format!("{}: {err}", path.display()));
                    self.rollback(&mut summary).await;
                    return Ok(summary);
                }
            };

            let mut bulk = RecordBulk::new(self.config.bulk_size);
            for record in records {
                let mut flush = false;
                if let Some(document) = record.document {
                    summary.num_docs += 1;
                    flush |= bulk.add_entity_to_bulk(RecordEntity {
                        identifier: document.identifier.clone(),
                        source: source.source_id.clone(),
                        collection_id,
                        dataset: document,
                        original_document: record.original_document,
                    });
                }
                for link in record.services {
                    flush |= bulk.add_coupling_to_bulk(CouplingEntity {
                        dataset_identifier: link.dataset_identifier,
                        service_id: link.service_id,
                        service_type: link.service_type,
                        source: source.source_id.clone(),
                        distribution: link.distribution,
                    });
                }
                if flush && !send_bulk_data(self.store.as_ref(), &mut bulk, &mut summary).await {
                    return Ok(summary);
                }
            }
            if !send_bulk_data(self.store.as_ref(), &mut bulk, &mut summary).await {
                return Ok(summary);
            }

            match self.store.delete_non_fetched_datasets(&source.source_id, cutoff).await {
                Ok(0) => {}
                Ok(marked) => info!(marked, "rows not delivered by this run marked deleted"),
                Err(err) => {
                    error!(error = %err, "deleting non-fetched datasets failed; rolling back");
                    summary.database_error(err.to_string());
                    self.rollback(&mut summary).await;
                    return Ok(summary);
                }
            }

            let finished = if self.config.dry_run {
                self.store.rollback_transaction().await
            } else {
                self.store.commit_transaction().await
            };
            if let Err(err) = finished {
                summary.database_error(err.to_string());
            }
            info!("{}", summary.log_line());
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Streams every bucket touching `source` (all buckets when `None`)
    /// through the reconciliation engine into the search index.
    pub async fn reconcile(&self, source: Option<&str>) -> Result<Summary> {
        let label = source.unwrap_or("all");
        let span = info_span!("reconcile", source = label, dry_run = self.config.dry_run);
        async move {
            let mut summary = Summary::new(label);
            let catalogs = match self.store.list_catalogs().await {
                Ok(catalogs) => CatalogCache::new(catalogs),
                Err(err) => {
                    summary.database_error(err.to_string());
                    return Ok(summary);
                }
            };
            let indexed = match self.index.indexed_ids().await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(error = %err, "indexed-id snapshot unavailable; deletes are sent unfiltered");
                    None
                }
            };
            info!(catalogs = catalogs.len(), snapshot = indexed.is_some(), "reconcile started");

            let mut engine = Reconciler::new(indexed);
            let mut assembler = BucketAssembler::new(catalogs);
            let mut bulk = IndexBulk::new(self.config.bulk_size);
            let mut rows = self.store.bucket_rows(source);
            let mut buckets = 0usize;
            let mut complete = true;
            while let Some(row) = rows.next().await {
                let row = match row {
                    Ok(row) => row,
                    Err(err) => {
                        error!(error = %err, "bucket read-back failed");
                        summary.database_error(err.to_string());
                        complete = false;
                        break;
                    }
                };
                if let Some(bucket) = assembler.push(row) {
                    buckets += 1;
                    self.process_bucket(&mut engine, bucket, &mut bulk, &mut summary).await;
                }
            }
            drop(rows);
            // a bucket cut short by a read error is never reconciled
            if let Some(bucket) = assembler.finish().filter(|_| complete) {
                buckets += 1;
                self.process_bucket(&mut engine, bucket, &mut bulk, &mut summary).await;
            }
            self.flush(&mut bulk, &mut summary).await;

            info!(buckets, "{}", summary.log_line());
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn process_bucket(
        &self,
        engine: &mut Reconciler,
        bucket: Bucket,
        bulk: &mut IndexBulk,
        summary: &mut Summary,
    ) {
        let anchor_id = bucket.anchor_id;
        match engine.process(bucket) {
            Ok(ops) => {
                summary.num_docs += ops.iter().filter(|op| !op.is_delete()).count();
                if bulk.add_operation_chunks_to_bulk(ops) {
                    self.flush(bulk, summary).await;
                }
            }
            Err(err) => {
                error!(anchor_id, error = %err, "bucket skipped");
                summary.warn("bucket", err.to_string());
                summary.skipped_docs.push(format!("bucket {anchor_id}"));
            }
        }
    }

    async fn flush(&self, bulk: &mut IndexBulk, summary: &mut Summary) {
        if self.config.dry_run {
            let dropped = bulk.discard();
            if dropped > 0 {
                info!(dropped, "dry run; index operations discarded");
            }
            return;
        }
        let applied = bulk.send_bulk_operations(self.index.as_ref(), summary).await;
        if applied > 0 {
            info!(applied, "index operations applied");
        }
    }

    /// Imports every enabled source (or only `only`), then reconciles.
    pub async fn run(&self, only: Option<&str>) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_source_registry().await?;
        let sources: Vec<&SourceConfig> = match only {
            Some(id) => match registry.find(id) {
                Some(source) => vec![source],
                None => bail!("unknown source `{id}`"),
            },
            None => registry.enabled().collect(),
        };

        let mut imports = Vec::with_capacity(sources.len());
        for source in sources {
            imports.push(self.import_source(source, started_at).await?);
        }
        let reconcile = self.reconcile(only).await?;

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            imports,
            reconcile,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::TimeZone;
    use harvester_core::IndexDocument;

    use super::*;

    pub fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).single().unwrap()
    }

    pub fn document(identifier: &str, source_type: &str) -> IndexDocument {
        let value = serde_json::json!({
            "identifier": identifier,
            "title": format!("Plan {identifier}"),
            "description": "",
            "catalog": {"identifier": "hh", "title": "Hamburg"},
            "extras": {"metadata": {
                "harvested": ts(),
                "issued": ts(),
                "modified": ts(),
                "source": {"source_type": source_type, "source_base": ""},
                "is_valid": true
            }}
        });
        serde_json::from_value(value).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - source_id: cockpit-dcat
    display_name: Cockpit DCAT-AP.PLU
    kind: dcatapplu
    source_type: cockpit
    catalog:
      identifier: hh
      title: Hamburg
    input: fixtures/dcatapplu/catalog.rdf
    custom_hooks: [normalize-whitespace]
  - source_id: excel
    display_name: Excel
    enabled: false
    kind: excel_sparse
    catalog: {identifier: hh, title: Hamburg}
    input: fixtures/excel/sheet.json
    max_records: 10
"#;

    #[test]
    fn registry_overrides_source_type_and_defaults_enabled() {
        let registry: SourceRegistry = serde_yaml::from_str(REGISTRY).unwrap();
        assert_eq!(registry.enabled().count(), 1);
        let cockpit = registry.find("cockpit-dcat").unwrap();
        let settings = cockpit.mapper_settings();
        assert_eq!(settings.kind, MapperKind::Dcatapplu);
        assert_eq!(settings.source_type, SourceType::Cockpit);
        assert_eq!(settings.custom_hooks, vec!["normalize-whitespace"]);

        let excel = registry.find("excel").unwrap().mapper_settings();
        assert_eq!(excel.source_type, SourceType::ExcelSparse);
        assert_eq!(excel.max_records, Some(10));
    }

    #[test]
    fn elastic_config_only_when_url_is_set() {
        let mut config = SyncConfig::default();
        assert!(config.elastic_config().is_none());
        config.elastic_url = Some("http://es:9200".into());
        config.http_timeout_secs = 5;
        let elastic = config.elastic_config().unwrap();
        assert_eq!(elastic.index, "plu");
        assert_eq!(elastic.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn registry_is_read_from_the_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sources.yaml"), REGISTRY).unwrap();
        let config = SyncConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let pipeline = SyncPipeline::new(config, Arc::new(InMemoryStore::new()), Arc::new(InMemoryIndex::new()));
        let registry = pipeline.load_source_registry().await.unwrap();
        assert_eq!(registry.sources.len(), 2);

        let err = pipeline.run(Some("missing")).await.unwrap_err();
        assert!(err.to_string().contains("unknown source"));
    }
}
