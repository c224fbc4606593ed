//! Core value model for the PLU metadata harvester.
//!
//! Every mapper produces an [`IndexDocument`], every reconciliation step
//! manipulates one, and the storage layer persists them as JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod geometry;
pub mod plu;

pub use geometry::Geometry;
pub use plu::{DocType, PlanState, PlanType, ProcedureState, ProcedureType, ProcessStepType};

pub const CRATE_NAME: &str = "harvester-core";

/// Tag identifying the upstream system a record came from.
///
/// Drives the source-type priority order during reconciliation. Tags that are
/// not known to this crate are preserved verbatim in [`SourceType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceType {
    CockpitPro,
    Cockpit,
    BeteiligungsDb,
    Csw,
    Wfs,
    DcatApPlu,
    ExcelSparse,
    Other(String),
}

impl SourceType {
    pub fn as_str(&self) -> &str {
        match self {
            SourceType::CockpitPro => "cockpitpro",
            SourceType::Cockpit => "cockpit",
            SourceType::BeteiligungsDb => "beteiligungsdb",
            SourceType::Csw => "csw",
            SourceType::Wfs => "wfs",
            SourceType::DcatApPlu => "dcatapplu",
            SourceType::ExcelSparse => "excel_sparse",
            SourceType::Other(tag) => tag,
        }
    }

    /// Reconciliation rank; 1 is the most authoritative. Unranked tags fall
    /// through to the "first record wins" rule.
    pub fn priority(&self) -> Option<u8> {
        match self {
            SourceType::CockpitPro => Some(1),
            SourceType::Cockpit => Some(2),
            SourceType::BeteiligungsDb => Some(3),
            SourceType::Csw => Some(4),
            SourceType::Wfs => Some(5),
            _ => None,
        }
    }

    /// The single lower-ranked source type a primary of this type keeps as a
    /// duplicate for later field merging.
    pub fn retained_duplicate(&self) -> Option<SourceType> {
        match self {
            SourceType::Cockpit => Some(SourceType::BeteiligungsDb),
            SourceType::Csw => Some(SourceType::Wfs),
            _ => None,
        }
    }

    pub fn ranked() -> [SourceType; 5] {
        [
            SourceType::CockpitPro,
            SourceType::Cockpit,
            SourceType::BeteiligungsDb,
            SourceType::Csw,
            SourceType::Wfs,
        ]
    }
}

impl From<&str> for SourceType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "cockpitpro" => SourceType::CockpitPro,
            "cockpit" => SourceType::Cockpit,
            "beteiligungsdb" => SourceType::BeteiligungsDb,
            "csw" => SourceType::Csw,
            "wfs" => SourceType::Wfs,
            "dcatapplu" => SourceType::DcatApPlu,
            "excel_sparse" => SourceType::ExcelSparse,
            _ => SourceType::Other(value.trim().to_string()),
        }
    }
}

impl From<String> for SourceType {
    fn from(value: String) -> Self {
        SourceType::from(value.as_str())
    }
}

impl From<SourceType> for String {
    fn from(value: SourceType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub organization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

/// Publisher, maintainer or contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Agent {
    Organization(Organization),
    Person(Person),
}

impl Agent {
    pub fn organization(name: impl Into<String>) -> Self {
        Agent::Organization(Organization {
            organization: name.into(),
            homepage: None,
            agent_type: None,
        })
    }

    pub fn person(name: impl Into<String>) -> Self {
        Agent::Person(Person {
            name: name.into(),
            homepage: None,
            agent_type: None,
        })
    }

    pub fn display_name(&self) -> &str {
        match self {
            Agent::Organization(org) => &org.organization,
            Agent::Person(person) => &person.name,
        }
    }

    pub fn with_homepage(mut self, homepage: Option<String>) -> Self {
        match &mut self {
            Agent::Organization(org) => org.homepage = homepage,
            Agent::Person(person) => person.homepage = homepage,
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPoint {
    #[serde(rename = "fn", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_telephone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_street_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_country_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_url: Option<String>,
}

impl ContactPoint {
    pub fn is_empty(&self) -> bool {
        self == &ContactPoint::default()
    }
}

/// Closed or half-open date range; either bound may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(gte: Option<DateTime<Utc>>, lte: Option<DateTime<Utc>>) -> Option<Self> {
        if gte.is_none() && lte.is_none() {
            None
        } else {
            Some(Self { gte, lte })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(rename = "accessURL")]
    pub access_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub format: Vec<String>,
    #[serde(rename = "downloadURL", default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<DateRange>,
    #[serde(rename = "mapLayerNames", default, skip_serializing_if = "Vec::is_empty")]
    pub map_layer_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(rename = "pluDocType", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<DocType>,
    #[serde(rename = "resolvedGeometry", default, skip_serializing_if = "Option::is_none")]
    pub resolved_geometry: Option<Geometry>,
}

impl Distribution {
    pub fn new(access_url: impl Into<String>) -> Self {
        Self {
            access_url: access_url.into(),
            ..Default::default()
        }
    }

    /// Identity of a distribution for coupling/merging purposes. Descriptive
    /// fields (title, description, layer names, errors, resolved geometry) are
    /// left out so differently described copies of one resource collide.
    pub fn content_hash(&self) -> String {
        let mut formats = self
            .format
            .iter()
            .map(|f| f.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();
        formats.sort();
        formats.dedup();
        let temporal = self
            .temporal
            .as_ref()
            .map(|t| {
                format!(
                    "{}..{}",
                    t.gte.map(|d| d.to_rfc3339()).unwrap_or_default(),
                    t.lte.map(|d| d.to_rfc3339()).unwrap_or_default()
                )
            })
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        for part in [
            self.access_url.trim(),
            &formats.join(","),
            self.download_url.as_deref().unwrap_or_default().trim(),
            &temporal,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn has_format(&self, tag: &str) -> bool {
        self.format.iter().any(|f| f.eq_ignore_ascii_case(tag))
    }

    /// Folds a colliding distribution into this one: the longer title wins,
    /// layer names and errors are unioned.
    pub fn absorb(&mut self, other: Distribution) {
        let other_len = other.title.as_deref().map(str::len).unwrap_or(0);
        let own_len = self.title.as_deref().map(str::len).unwrap_or(0);
        if other_len > own_len {
            self.title = other.title;
        }
        if self.description.is_none() {
            self.description = other.description;
        }
        for name in other.map_layer_names {
            if !self.map_layer_names.contains(&name) {
                self.map_layer_names.push(name);
            }
        }
        for err in other.errors {
            if !self.errors.contains(&err) {
                self.errors.push(err);
            }
        }
        if self.resolved_geometry.is_none() {
            self.resolved_geometry = other.resolved_geometry;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(rename = "type")]
    pub step_type: ProcessStepType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distributions: Vec<Distribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<DateRange>,
}

/// Descriptive metadata of the collection a record was harvested into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub identifier: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<Agent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSource {
    pub source_type: SourceType,
    pub source_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
}

/// Provenance and quality bookkeeping (`extras.metadata`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub harvested: DateTime<Utc>,
    pub issued: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub source: MetadataSource,
    #[serde(default)]
    pub harvesting_errors: Vec<String>,
    pub is_valid: bool,
    #[serde(default)]
    pub merged_from: Vec<String>,
    #[serde(default)]
    pub quality_notes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedData {
    pub dcat_ap_plu: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extras {
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformed_data: Option<TransformedData>,
}

/// Normalized document shape shared by every source protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adms_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_identifier: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<Agent>,
    #[serde(default)]
    pub maintainers: Vec<Agent>,
    #[serde(default)]
    pub contributors: Vec<Agent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_point: Option<ContactPoint>,
    #[serde(default)]
    pub distributions: Vec<Distribution>,
    #[serde(default)]
    pub catalog: Catalog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    #[serde(default)]
    pub plan_state: PlanState,
    #[serde(default)]
    pub plan_type: PlanType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_type_fine: Option<String>,
    #[serde(default)]
    pub procedure_state: ProcedureState,
    #[serde(default)]
    pub procedure_type: ProcedureType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure_period: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure_start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_or_procedure_start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub process_steps: Vec<ProcessStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<Geometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial: Option<Geometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centroid: Option<Geometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    pub extras: Extras,
}

impl IndexDocument {
    /// Search-index key: the global ADMS identifier when present, otherwise
    /// `catalog.identifier/identifier`.
    pub fn canonical_id(&self) -> String {
        match self.adms_identifier.as_deref().map(str::trim) {
            Some(adms) if !adms.is_empty() => adms.to_string(),
            _ => format!("{}/{}", self.catalog.identifier, self.identifier),
        }
    }

    /// Grouping key shared by records that describe the same plan across
    /// sources: ADMS identifier, then resource identifier, then own identifier.
    pub fn anchor_key(&self) -> String {
        [self.adms_identifier.as_deref(), self.resource_identifier.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or(self.identifier.trim())
            .to_lowercase()
    }

    pub fn source_type(&self) -> &SourceType {
        &self.extras.metadata.source.source_type
    }

    pub fn is_valid(&self) -> bool {
        self.extras.metadata.is_valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.extras.metadata.is_valid = valid;
    }

    pub fn add_quality_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !self.extras.metadata.quality_notes.contains(&note) {
            self.extras.metadata.quality_notes.push(note);
        }
    }

    /// Appends to `merged_from`; the list never shrinks and holds each id once.
    pub fn record_merged_from(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.extras.metadata.merged_from.contains(&id) {
            self.extras.metadata.merged_from.push(id);
        }
    }
}

/// Per-job side channel for counters and messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub num_docs: usize,
    pub num_errors: usize,
    pub skipped_docs: Vec<String>,
    pub warnings: Vec<(String, String)>,
    pub app_errors: Vec<String>,
    pub database_errors: Vec<String>,
    pub elastic_errors: Vec<String>,
}

impl Summary {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_id: source_id.into(),
            started_at: Utc::now(),
            num_docs: 0,
            num_errors: 0,
            skipped_docs: Vec::new(),
            warnings: Vec::new(),
            app_errors: Vec::new(),
            database_errors: Vec::new(),
            elastic_errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        self.warnings.push((kind.into(), message.into()));
    }

    pub fn app_error(&mut self, message: impl Into<String>) {
        self.num_errors += 1;
        self.app_errors.push(message.into());
    }

    pub fn database_error(&mut self, message: impl Into<String>) {
        self.num_errors += 1;
        self.database_errors.push(message.into());
    }

    pub fn elastic_error(&mut self, message: impl Into<String>) {
        self.num_errors += 1;
        self.elastic_errors.push(message.into());
    }

    /// A job fails when any write path reported an error; mapping problems
    /// only degrade individual documents.
    pub fn is_failed(&self) -> bool {
        !self.database_errors.is_empty() || !self.elastic_errors.is_empty()
    }

    pub fn log_line(&self) -> String {
        format!(
            "source={} run_id={} docs={} errors={} skipped={} warnings={} app_errors={} db_errors={} elastic_errors={}",
            self.source_id,
            self.run_id,
            self.num_docs,
            self.num_errors,
            self.skipped_docs.len(),
            self.warnings.len(),
            self.app_errors.len(),
            self.database_errors.len(),
            self.elastic_errors.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn doc(identifier: &str, catalog: &str, adms: Option<&str>) -> IndexDocument {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().unwrap();
        IndexDocument {
            identifier: identifier.to_string(),
            adms_identifier: adms.map(ToString::to_string),
            resource_identifier: None,
            title: "Bebauungsplan Nord".to_string(),
            description: String::new(),
            keywords: vec![],
            publisher: None,
            maintainers: vec![],
            contributors: vec![],
            contact_point: None,
            distributions: vec![],
            catalog: Catalog {
                identifier: catalog.to_string(),
                title: catalog.to_string(),
                ..Default::default()
            },
            plan_name: None,
            plan_state: PlanState::Unknown,
            plan_type: PlanType::Unknown,
            plan_type_fine: None,
            procedure_state: ProcedureState::Unknown,
            procedure_type: ProcedureType::Unknown,
            procedure_period: None,
            procedure_start_date: None,
            plan_or_procedure_start_date: None,
            process_steps: vec![],
            bounding_box: None,
            spatial: None,
            centroid: None,
            spatial_text: None,
            issued: None,
            modified: None,
            extras: Extras {
                metadata: Metadata {
                    harvested: now,
                    issued: now,
                    modified: now,
                    source: MetadataSource {
                        source_type: SourceType::Csw,
                        source_base: "https://example.org/csw".to_string(),
                        raw_data_source: None,
                        portal_link: None,
                        attribution: None,
                    },
                    harvesting_errors: vec![],
                    is_valid: true,
                    merged_from: vec![],
                    quality_notes: vec![],
                },
                transformed_data: None,
            },
        }
    }

    #[test]
    fn canonical_id_prefers_adms_identifier() {
        assert_eq!(doc("abc", "hh", Some("urn:adms:1")).canonical_id(), "urn:adms:1");
        assert_eq!(doc("abc", "hh", Some("  ")).canonical_id(), "hh/abc");
        assert_eq!(doc("abc", "hh", None).canonical_id(), "hh/abc");
    }

    #[test]
    fn anchor_key_falls_back_through_identifiers() {
        let mut d = doc("ABC", "hh", None);
        assert_eq!(d.anchor_key(), "abc");
        d.resource_identifier = Some("BP-Nord-12".into());
        assert_eq!(d.anchor_key(), "bp-nord-12");
        d.adms_identifier = Some("urn:adms:1".into());
        assert_eq!(d.anchor_key(), "urn:adms:1");
    }

    #[test]
    fn source_type_round_trips_known_and_unknown_tags() {
        for tag in ["cockpitpro", "cockpit", "beteiligungsdb", "csw", "wfs", "dcatapplu"] {
            assert_eq!(SourceType::from(tag).as_str(), tag);
        }
        assert_eq!(SourceType::from("WFS"), SourceType::Wfs);
        assert_eq!(SourceType::from("kommune-x"), SourceType::Other("kommune-x".into()));
        let json = serde_json::to_string(&SourceType::BeteiligungsDb).unwrap();
        assert_eq!(json, "\"beteiligungsdb\"");
        let back: SourceType = serde_json::from_str("\"cockpitpro\"").unwrap();
        assert_eq!(back, SourceType::CockpitPro);
    }

    #[test]
    fn ranking_is_a_total_order_over_known_tags() {
        let ranks = SourceType::ranked()
            .iter()
            .map(|s| s.priority().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        assert_eq!(SourceType::DcatApPlu.priority(), None);
        assert_eq!(SourceType::Cockpit.retained_duplicate(), Some(SourceType::BeteiligungsDb));
        assert_eq!(SourceType::Csw.retained_duplicate(), Some(SourceType::Wfs));
        assert_eq!(SourceType::CockpitPro.retained_duplicate(), None);
    }

    #[test]
    fn content_hash_ignores_descriptive_fields() {
        let mut a = Distribution::new("https://example.org/wms");
        a.format = vec!["WMS".into()];
        a.title = Some("Layer".into());
        let mut b = a.clone();
        b.title = Some("A much longer layer title".into());
        b.map_layer_names = vec!["bp_nord".into()];
        assert_eq!(a.content_hash(), b.content_hash());

        let mut c = a.clone();
        c.format = vec!["WFS".into()];
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn absorb_prefers_longer_title_and_unions_lists() {
        let mut a = Distribution::new("https://example.org/wms");
        a.title = Some("WMS".into());
        a.map_layer_names = vec!["one".into()];
        a.errors = vec!["timeout".into()];
        let mut b = a.clone();
        b.title = Some("WMS Bebauungspläne".into());
        b.map_layer_names = vec!["one".into(), "two".into()];
        b.errors = vec!["timeout".into(), "404".into()];
        a.absorb(b);
        assert_eq!(a.title.as_deref(), Some("WMS Bebauungspläne"));
        assert_eq!(a.map_layer_names, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(a.errors, vec!["timeout".to_string(), "404".to_string()]);
    }

    #[test]
    fn merged_from_only_grows_and_stays_distinct() {
        let mut d = doc("abc", "hh", None);
        d.record_merged_from("hh/abc");
        d.record_merged_from("hh/def");
        d.record_merged_from("hh/abc");
        assert_eq!(d.extras.metadata.merged_from, vec!["hh/abc", "hh/def"]);
    }

    #[test]
    fn agent_union_serializes_by_shape() {
        let org = Agent::organization("Stadt Musterstadt");
        let json = serde_json::to_value(&org).unwrap();
        assert_eq!(json["organization"], "Stadt Musterstadt");
        let back: Agent = serde_json::from_value(serde_json::json!({"name": "Erika"})).unwrap();
        assert_eq!(back, Agent::person("Erika"));
    }

    #[test]
    fn document_json_uses_wire_names() {
        let mut d = doc("abc", "hh", None);
        let mut dist = Distribution::new("https://example.org/plan.pdf");
        dist.map_layer_names = vec!["layer".into()];
        d.distributions.push(dist);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["distributions"][0]["accessURL"], "https://example.org/plan.pdf");
        assert_eq!(json["distributions"][0]["mapLayerNames"][0], "layer");
        assert_eq!(json["plan_state"], "unbekannt");
        assert_eq!(json["extras"]["metadata"]["source"]["source_type"], "csw");
    }

    #[test]
    fn summary_fails_only_on_write_errors() {
        let mut s = Summary::new("csw-hh");
        s.app_error("hook failed");
        s.warn("mapping", "missing abstract");
        assert!(!s.is_failed());
        s.database_error("row count mismatch");
        assert!(s.is_failed());
        assert_eq!(s.num_errors, 2);
        assert!(s.log_line().contains("db_errors=1"));
    }
}
