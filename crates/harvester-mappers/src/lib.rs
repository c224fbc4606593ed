//! Source mapper contracts + per-protocol mapper implementations.
//!
//! A [`Mapper`] wraps one raw record and exposes the fixed getter surface the
//! [`IndexDocumentFactory`] consumes. Getters never fail: absent or malformed
//! fields resolve to `None`/empty and are reported through the
//! [`MapperContext`].

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use harvester_core::{
    Agent, Catalog, ContactPoint, DateRange, Distribution, Geometry, MetadataSource, PlanState,
    PlanType, ProcedureState, ProcedureType, ProcessStep, SourceType, Summary,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod codelist;
pub mod csw;
pub mod dcatapplu;
pub mod excel;
pub mod factory;
mod gml;
pub mod hooks;
pub mod ids;
pub mod wfs;
mod xml;

pub use factory::IndexDocumentFactory;
pub use hooks::{HookError, HookRegistry};
pub use ids::IdGenerator;

pub const CRATE_NAME: &str = "harvester-mappers";

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("malformed xml: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no <{expected}> records found")]
    MissingRoot { expected: &'static str },
    #[error("sheet has no header row")]
    MissingHeader,
}

/// Wire format of a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapperKind {
    Csw,
    Dcatapplu,
    WfsXplan,
    WfsFis,
    WfsFeaturetype,
    ExcelSparse,
}

impl MapperKind {
    pub fn default_source_type(&self) -> SourceType {
        match self {
            MapperKind::Csw => SourceType::Csw,
            MapperKind::Dcatapplu => SourceType::DcatApPlu,
            MapperKind::WfsXplan | MapperKind::WfsFis | MapperKind::WfsFeaturetype => SourceType::Wfs,
            MapperKind::ExcelSparse => SourceType::ExcelSparse,
        }
    }
}

/// Per-source settings every mapper of one import run shares.
#[derive(Debug, Clone)]
pub struct MapperSettings {
    pub source_id: String,
    pub kind: MapperKind,
    pub source_type: SourceType,
    pub source_base: String,
    pub portal_link: Option<String>,
    pub attribution: Option<String>,
    pub catalog: Catalog,
    pub custom_hooks: Vec<String>,
    pub max_records: Option<usize>,
}

impl MapperSettings {
    pub fn new(source_id: impl Into<String>, kind: MapperKind, catalog: Catalog) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            source_type: kind.default_source_type(),
            source_base: String::new(),
            portal_link: None,
            attribution: None,
            catalog,
            custom_hooks: Vec::new(),
            max_records: None,
        }
    }
}

/// Shared per-record state: harvest time, settings, and the error channel
/// getters report into.
#[derive(Debug)]
pub struct MapperContext<'s> {
    pub harvest_time: DateTime<Utc>,
    pub settings: &'s MapperSettings,
    errors: RefCell<Vec<String>>,
    valid: Cell<bool>,
}

impl<'s> MapperContext<'s> {
    pub fn new(settings: &'s MapperSettings, harvest_time: DateTime<Utc>) -> Self {
        Self {
            harvest_time,
            settings,
            errors: RefCell::new(Vec::new()),
            valid: Cell::new(true),
        }
    }

    /// Recoverable field problem: logged, the record stays valid.
    pub fn warn_field(&self, field: &str, message: impl AsRef<str>) {
        warn!(source = %self.settings.source_id, field, "{}", message.as_ref());
    }

    /// Mandatory field problem: recorded as a harvesting error and the record
    /// is marked unusable.
    pub fn invalidate(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(source = %self.settings.source_id, "{message}");
        self.valid.set(false);
        let mut errors = self.errors.borrow_mut();
        if !errors.contains(&message) {
            errors.push(message);
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.borrow().clone()
    }
}

/// A service endpoint that operates on (renders/serves) a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceLink {
    pub dataset_identifier: String,
    pub service_id: String,
    pub service_type: String,
    pub distribution: Distribution,
}

/// Getter surface shared by every source protocol.
pub trait Mapper {
    fn context(&self) -> &MapperContext<'_>;

    fn source_type(&self) -> SourceType {
        self.context().settings.source_type.clone()
    }

    fn title(&self) -> String;
    fn description(&self) -> String;

    /// Record identifier, stable per source and record. Mappers without a
    /// native identifier draw one from the run's generator.
    fn generated_id(&self, ids: &mut IdGenerator) -> String;

    fn adms_identifier(&self) -> Option<String> {
        None
    }

    fn resource_identifier(&self) -> Option<String> {
        None
    }

    fn raw_data_source(&self) -> Option<String> {
        None
    }

    fn metadata_source(&self) -> MetadataSource {
        let settings = self.context().settings;
        MetadataSource {
            source_type: self.source_type(),
            source_base: settings.source_base.clone(),
            raw_data_source: self.raw_data_source(),
            portal_link: settings.portal_link.clone(),
            attribution: settings.attribution.clone(),
        }
    }

    fn harvesting_date(&self) -> DateTime<Utc> {
        self.context().harvest_time
    }

    fn issued(&self) -> Option<DateTime<Utc>>;
    fn modified_date(&self) -> Option<DateTime<Utc>>;
    fn publisher(&self) -> Option<Agent>;

    fn maintainers(&self) -> Vec<Agent> {
        Vec::new()
    }

    fn contributors(&self) -> Vec<Agent> {
        Vec::new()
    }

    fn contact_point(&self) -> Option<ContactPoint> {
        None
    }

    fn keywords(&self) -> Vec<String> {
        Vec::new()
    }

    fn distributions(&self) -> Vec<Distribution>;
    fn bounding_box(&self) -> Option<Geometry>;
    fn spatial(&self) -> Option<Geometry>;

    fn centroid(&self) -> Option<Geometry> {
        None
    }

    fn spatial_text(&self) -> Option<String> {
        None
    }

    fn plan_name(&self) -> Option<String> {
        None
    }

    fn plan_state(&self) -> PlanState {
        PlanState::Unknown
    }

    fn plan_type(&self) -> PlanType {
        PlanType::Unknown
    }

    fn plan_type_fine(&self) -> Option<String> {
        None
    }

    fn procedure_state(&self) -> ProcedureState {
        ProcedureState::Unknown
    }

    fn procedure_type(&self) -> ProcedureType {
        ProcedureType::Unknown
    }

    fn procedure_period(&self) -> Option<DateRange> {
        None
    }

    fn process_steps(&self) -> Vec<ProcessStep> {
        Vec::new()
    }

    /// Raw record text kept next to the mapped document in the store.
    fn original_document(&self) -> Option<String> {
        None
    }

    /// False for records that only describe services of other datasets.
    fn describes_dataset(&self) -> bool {
        true
    }

    fn coupled_services(&self) -> Vec<ServiceLink> {
        Vec::new()
    }
}

/// One record of a source after mapping.
#[derive(Debug, Clone)]
pub struct MappedRecord {
    pub document: Option<harvester_core::IndexDocument>,
    pub original_document: Option<String>,
    pub services: Vec<ServiceLink>,
}

/// Maps every record of a raw source payload, in delivery order.
pub fn map_source(
    raw: &str,
    settings: &MapperSettings,
    factory: &mut IndexDocumentFactory,
    harvest_time: DateTime<Utc>,
    summary: &mut Summary,
) -> Result<Vec<MappedRecord>, MapperError> {
    match settings.kind {
        MapperKind::Csw => csw::map_records(raw, settings, factory, harvest_time, summary),
        MapperKind::Dcatapplu => dcatapplu::map_records(raw, settings, factory, harvest_time, summary),
        MapperKind::WfsXplan => {
            wfs::map_features(raw, wfs::WfsProfile::Xplan, settings, factory, harvest_time, summary)
        }
        MapperKind::WfsFis => {
            wfs::map_features(raw, wfs::WfsProfile::Fis, settings, factory, harvest_time, summary)
        }
        MapperKind::WfsFeaturetype => {
            wfs::map_feature_types(raw, settings, factory, harvest_time, summary)
        }
        MapperKind::ExcelSparse => excel::map_rows(raw, settings, factory, harvest_time, summary),
    }
}

pub fn read_source_file(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

pub(crate) fn map_one(
    mapper: &dyn Mapper,
    factory: &mut IndexDocumentFactory,
    summary: &mut Summary,
) -> MappedRecord {
    let document = mapper
        .describes_dataset()
        .then(|| factory.create(mapper, summary));
    MappedRecord {
        document,
        original_document: mapper.original_document(),
        services: mapper.coupled_services(),
    }
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Accepts RFC 3339, ISO dates with or without time, and `dd.mm.yyyy`.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    let date_part = value.get(..10).unwrap_or(value);
    for fmt in ["%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Guesses a service/file format tag from a URL and an optional protocol name.
pub(crate) fn guess_format(url: &str, protocol: Option<&str>) -> Vec<String> {
    let haystack = format!("{} {}", protocol.unwrap_or_default(), url).to_ascii_lowercase();
    for (needle, tag) in [
        ("service=wms", "WMS"),
        ("ogc:wms", "WMS"),
        ("service=wfs", "WFS"),
        ("ogc:wfs", "WFS"),
        ("service=csw", "CSW"),
    ] {
        if haystack.contains(needle) {
            return vec![tag.to_string()];
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit_once('.') {
        Some((_, ext)) if (2..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            vec![ext.to_ascii_uppercase()]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    use chrono::TimeZone;

    use super::*;

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture(rel: &str) -> String {
        read_source_file(workspace_root().join("fixtures").join(rel)).expect("read fixture")
    }

    pub fn harvest_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).single().unwrap()
    }

    pub fn settings(kind: MapperKind) -> MapperSettings {
        let mut settings = MapperSettings::new(
            format!("{kind:?}").to_lowercase(),
            kind,
            Catalog {
                identifier: "hh".into(),
                title: "Freie und Hansestadt Hamburg".into(),
                publisher: Some(Agent::organization("Landesbetrieb Geoinformation")),
                ..Default::default()
            },
        );
        settings.source_base = "https://geodienste.example.org/service".into();
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_accept_common_upstream_shapes() {
        let expected = Utc.with_ymd_and_hms(2023, 4, 5, 0, 0, 0).single().unwrap();
        assert_eq!(parse_date("2023-04-05"), Some(expected));
        assert_eq!(parse_date("05.04.2023"), Some(expected));
        assert_eq!(parse_date("2023-04-05T00:00:00"), Some(expected));
        assert_eq!(parse_date("2023-04-05T02:00:00+02:00"), Some(expected));
        assert_eq!(parse_date("2023-04-05Z"), Some(expected));
        assert_eq!(parse_date("soon"), None);
    }

    #[test]
    fn formats_are_guessed_from_service_urls_and_extensions() {
        assert_eq!(guess_format("https://x.org/ows?SERVICE=WMS&REQUEST=GetCapabilities", None), vec!["WMS"]);
        assert_eq!(guess_format("https://x.org/ows", Some("OGC:WFS")), vec!["WFS"]);
        assert_eq!(guess_format("https://x.org/docs/plan.pdf", None), vec!["PDF"]);
        assert!(guess_format("https://x.org/landing", None).is_empty());
    }

    #[test]
    fn invalidation_is_recorded_once() {
        let settings = test_support::settings(MapperKind::Csw);
        let ctx = MapperContext::new(&settings, test_support::harvest_time());
        assert!(ctx.is_valid());
        ctx.invalidate("Missing abstract");
        ctx.invalidate("Missing abstract");
        assert!(!ctx.is_valid());
        assert_eq!(ctx.errors(), vec!["Missing abstract".to_string()]);
    }
}
