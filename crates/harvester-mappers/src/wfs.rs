//! WFS mappers: plan features (XPlanGML and FIS-Broker profiles) and the
//! feature types announced in a GetCapabilities document.

use chrono::{DateTime, Utc};
use harvester_core::{
    Agent, ContactPoint, DateRange, DocType, Distribution, Geometry, PlanState, PlanType,
    ProcedureState, ProcedureType, ProcessStep, ProcessStepType, Summary,
};
use once_cell::unsync::OnceCell;
use roxmltree::{Document, Node};

use crate::{
    codelist, gml, guess_format, map_one, parse_date, text_or_none, xml, IdGenerator,
    IndexDocumentFactory, MappedRecord, Mapper, MapperContext, MapperError, MapperSettings,
    ServiceLink,
};

/// Attribute layout of the features a WFS delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WfsProfile {
    /// XPlanGML plan objects (`BP_Plan`, `FP_Plan`, ...).
    Xplan,
    /// Berlin FIS-Broker flat plan features.
    Fis,
}

impl WfsProfile {
    fn accepts(&self, typename: &str) -> bool {
        match self {
            WfsProfile::Xplan => codelist::XPLAN_PLAN_TYPES.contains_key(typename),
            WfsProfile::Fis => true,
        }
    }

    fn geometry_property(&self) -> &'static str {
        match self {
            WfsProfile::Xplan => "raeumlicherGeltungsbereich",
            WfsProfile::Fis => "spatial_geometry",
        }
    }
}

pub struct WfsFeatureMapper<'a, 'i, 's> {
    feature: Node<'a, 'i>,
    profile: WfsProfile,
    ctx: MapperContext<'s>,
    distributions: OnceCell<Vec<Distribution>>,
    plan_state: OnceCell<PlanState>,
}

impl<'a, 'i, 's> WfsFeatureMapper<'a, 'i, 's> {
    pub fn new(feature: Node<'a, 'i>, profile: WfsProfile, ctx: MapperContext<'s>) -> Self {
        Self {
            feature,
            profile,
            ctx,
            distributions: OnceCell::new(),
            plan_state: OnceCell::new(),
        }
    }

    fn typename(&self) -> &str {
        self.feature.tag_name().name()
    }

    fn gml_id(&self) -> Option<String> {
        xml::attr_of(self.feature, "id")
    }

    fn field(&self, name: &str) -> Option<String> {
        xml::text(self.feature, name)
    }

    fn date_field(&self, name: &str) -> Option<DateTime<Utc>> {
        let raw = self.field(name)?;
        let parsed = parse_date(&raw);
        if parsed.is_none() {
            self.ctx.warn_field(name, format!("unparseable date `{raw}`"));
        }
        parsed
    }

    fn plan_name_field(&self) -> Option<String> {
        match self.profile {
            WfsProfile::Xplan => self.field("name"),
            WfsProfile::Fis => self.field("planname"),
        }
    }

    fn get_feature_url(&self) -> String {
        let base = self.ctx.settings.source_base.trim_end_matches(['?', '&']);
        let mut url = format!(
            "{base}?SERVICE=WFS&VERSION=2.0.0&REQUEST=GetFeature&TYPENAMES={}",
            self.typename()
        );
        if let Some(id) = self.gml_id() {
            url.push_str("&FEATUREID=");
            url.push_str(&id);
        }
        url
    }

    fn xplan_distributions(&self) -> Vec<Distribution> {
        xml::nodes(self.feature, "externeReferenz/*")
            .into_iter()
            .filter_map(|reference| {
                let Some(url) = xml::text(reference, "referenzURL") else {
                    self.ctx.warn_field("externeReferenz", "reference without referenzURL");
                    return None;
                };
                let mut dist = Distribution::new(url.clone());
                dist.format = xml::text(reference, "referenzMimeType")
                    .and_then(|mime| mime.rsplit('/').next().map(str::to_ascii_uppercase))
                    .map(|f| vec![f])
                    .unwrap_or_else(|| guess_format(&url, None));
                dist.title = xml::text(reference, "referenzName");
                dist.description = xml::text(reference, "beschreibung");
                dist.issued = xml::text(reference, "datum").and_then(|d| parse_date(&d));
                dist.doc_type = Some(codelist::xplan_doc_type(xml::text(reference, "typ").as_deref()));
                Some(dist)
            })
            .collect()
    }

    fn fis_distributions(&self) -> Vec<Distribution> {
        [
            ("scan_www", "Planzeichnung", DocType::Planzeichnung),
            ("grund_www", "Begründung", DocType::Begruendung),
            ("ausleg_www", "Auslegungsunterlagen", DocType::SonstigesDokument),
        ]
        .into_iter()
        .filter_map(|(field, title, doc_type)| {
            let url = self.field(field)?;
            let mut dist = Distribution::new(url.clone());
            dist.format = guess_format(&url, None);
            dist.title = Some(title.to_string());
            dist.doc_type = Some(doc_type);
            Some(dist)
        })
        .collect()
    }

    fn step(&self, step_type: ProcessStepType, start: &str, end: &str) -> Option<ProcessStep> {
        let period = DateRange::new(self.date_field(start), self.date_field(end))?;
        Some(ProcessStep {
            identifier: None,
            step_type,
            distributions: Vec::new(),
            period: Some(period),
        })
    }
}

impl Mapper for WfsFeatureMapper<'_, '_, '_> {
    fn context(&self) -> &MapperContext<'_> {
        &self.ctx
    }

    fn title(&self) -> String {
        match self.plan_name_field() {
            Some(name) => name,
            None => {
                self.ctx.invalidate("Missing plan name");
                String::new()
            }
        }
    }

    fn description(&self) -> String {
        match self.profile {
            WfsProfile::Xplan => self.field("beschreibung"),
            WfsProfile::Fis => self.field("bereich"),
        }
        .unwrap_or_default()
    }

    fn generated_id(&self, ids: &mut IdGenerator) -> String {
        let local = self
            .gml_id()
            .or_else(|| self.plan_name_field())
            .unwrap_or_default();
        ids.next(&format!("{}:{local}", self.typename()))
    }

    fn resource_identifier(&self) -> Option<String> {
        match self.profile {
            WfsProfile::Xplan => self.field("internalId"),
            WfsProfile::Fis => None,
        }
    }

    fn raw_data_source(&self) -> Option<String> {
        Some(self.get_feature_url())
    }

    fn issued(&self) -> Option<DateTime<Utc>> {
        match self.profile {
            WfsProfile::Xplan => self.date_field("technHerstellDatum"),
            WfsProfile::Fis => self.date_field("festg_am"),
        }
    }

    fn modified_date(&self) -> Option<DateTime<Utc>> {
        match self.profile {
            WfsProfile::Xplan => self.date_field("aenderungenBisDatum"),
            WfsProfile::Fis => None,
        }
    }

    fn publisher(&self) -> Option<Agent> {
        let name = match self.profile {
            WfsProfile::Xplan => self
                .field("plangeber/XP_Plangeber/name")
                .or_else(|| self.field("gemeinde/XP_Gemeinde/gemeindeName")),
            WfsProfile::Fis => self.field("afs_behoer"),
        };
        name.map(Agent::organization)
    }

    fn distributions(&self) -> Vec<Distribution> {
        self.distributions
            .get_or_init(|| {
                let mut out = match self.profile {
                    WfsProfile::Xplan => self.xplan_distributions(),
                    WfsProfile::Fis => self.fis_distributions(),
                };
                let mut feature = Distribution::new(self.get_feature_url());
                feature.format = vec!["WFS".to_string()];
                feature.title = Some(format!("WFS {}", self.typename()));
                feature.map_layer_names = vec![self.typename().to_string()];
                out.push(feature);
                out
            })
            .clone()
    }

    fn bounding_box(&self) -> Option<Geometry> {
        gml::bounded_by(self.feature).or_else(|| {
            let spatial = self.spatial()?;
            harvester_core::geometry::bounding_box(&spatial)
        })
    }

    fn spatial(&self) -> Option<Geometry> {
        let property = xml::first(self.feature, self.profile.geometry_property())?;
        let geometry = gml::read_geometry(property);
        if geometry.is_none() {
            self.ctx
                .warn_field(self.profile.geometry_property(), "geometry could not be read as WGS84");
        }
        geometry
    }

    fn spatial_text(&self) -> Option<String> {
        match self.profile {
            WfsProfile::Xplan => {
                let gemeinde = "gemeinde/XP_Gemeinde";
                let parts = [
                    self.field(&format!("{gemeinde}/gemeindeName")),
                    self.field(&format!("{gemeinde}/ortsteilName")),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
                text_or_none(parts.join(", "))
            }
            WfsProfile::Fis => {
                let parts = [self.field("bezirk"), self.field("ortsteil")]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>();
                text_or_none(parts.join(", "))
            }
        }
    }

    fn plan_name(&self) -> Option<String> {
        self.plan_name_field()
    }

    fn plan_state(&self) -> PlanState {
        *self.plan_state.get_or_init(|| match self.profile {
            WfsProfile::Xplan => codelist::xplan_plan_state(self.field("rechtsstand").as_deref()),
            WfsProfile::Fis => codelist::fis_plan_state(self.field("festsg").as_deref()),
        })
    }

    fn plan_type(&self) -> PlanType {
        self.plan_type_pair().0
    }

    fn plan_type_fine(&self) -> Option<String> {
        self.plan_type_pair().1
    }

    fn procedure_state(&self) -> ProcedureState {
        codelist::procedure_state_for(self.plan_state())
    }

    fn procedure_type(&self) -> ProcedureType {
        match self.profile {
            WfsProfile::Xplan => codelist::xplan_procedure_type(self.field("verfahren").as_deref()),
            WfsProfile::Fis => ProcedureType::Unknown,
        }
    }

    fn procedure_period(&self) -> Option<DateRange> {
        match self.profile {
            WfsProfile::Xplan => DateRange::new(
                self.date_field("aufstellungsbeschlussDatum"),
                self.date_field("inkrafttretensDatum"),
            ),
            WfsProfile::Fis => DateRange::new(self.date_field("afs_beschl"), self.date_field("festg_am")),
        }
    }

    fn process_steps(&self) -> Vec<ProcessStep> {
        match self.profile {
            WfsProfile::Xplan => [
                self.step(
                    ProcessStepType::BeteiligungBehoerden,
                    "traegerbeteiligungsStartDatum",
                    "traegerbeteiligungsEndDatum",
                ),
                self.step(
                    ProcessStepType::OeffentlicheAuslegung,
                    "auslegungsStartDatum",
                    "auslegungsEndDatum",
                ),
            ]
            .into_iter()
            .flatten()
            .collect(),
            WfsProfile::Fis => Vec::new(),
        }
    }

    fn original_document(&self) -> Option<String> {
        Some(xml::outer_xml(self.feature))
    }
}

impl WfsFeatureMapper<'_, '_, '_> {
    fn plan_type_pair(&self) -> (PlanType, Option<String>) {
        match self.profile {
            WfsProfile::Xplan => codelist::xplan_plan_type(self.typename(), self.field("planArt").as_deref()),
            WfsProfile::Fis => codelist::fis_plan_type(self.field("planart").as_deref()),
        }
    }
}

/// Features of a `wfs:FeatureCollection`, in document order.
fn features<'a, 'i>(root: Node<'a, 'i>) -> Vec<Node<'a, 'i>> {
    root.descendants()
        .filter(|n| {
            n.is_element()
                && n.parent_element()
                    .map(|p| matches!(p.tag_name().name(), "member" | "featureMember" | "featureMembers"))
                    .unwrap_or(false)
        })
        .collect()
}

pub fn map_features(
    raw: &str,
    profile: WfsProfile,
    settings: &MapperSettings,
    factory: &mut IndexDocumentFactory,
    harvest_time: DateTime<Utc>,
    summary: &mut Summary,
) -> Result<Vec<MappedRecord>, MapperError> {
    let doc = Document::parse(raw)?;
    let members = features(doc.root_element());
    if members.is_empty() {
        return Err(MapperError::MissingRoot { expected: "wfs:member" });
    }
    let limit = settings.max_records.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    for feature in members {
        if out.len() >= limit {
            break;
        }
        let typename = feature.tag_name().name();
        if !profile.accepts(typename) {
            summary.skipped_docs.push(format!("{typename}:{}", xml::attr_of(feature, "id").unwrap_or_default()));
            continue;
        }
        let mapper = WfsFeatureMapper::new(feature, profile, MapperContext::new(settings, harvest_time));
        out.push(map_one(&mapper, factory, summary));
    }
    Ok(out)
}

/// One `wfs:FeatureType` of a capabilities document. Produces no dataset of
/// its own; it couples its service endpoint to the dataset it describes.
pub struct WfsFeatureTypeMapper<'a, 'i, 's> {
    feature_type: Node<'a, 'i>,
    capabilities: Node<'a, 'i>,
    ctx: MapperContext<'s>,
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, value)| text_or_none(value))
}

impl<'a, 'i, 's> WfsFeatureTypeMapper<'a, 'i, 's> {
    pub fn new(feature_type: Node<'a, 'i>, capabilities: Node<'a, 'i>, ctx: MapperContext<'s>) -> Self {
        Self {
            feature_type,
            capabilities,
            ctx,
        }
    }

    fn name(&self) -> Option<String> {
        xml::text(self.feature_type, "Name")
    }

    fn capabilities_url(&self) -> String {
        xml::nodes(self.capabilities, "OperationsMetadata/Operation")
            .into_iter()
            .find(|op| xml::attr_of(*op, "name").as_deref() == Some("GetCapabilities"))
            .and_then(|op| xml::attr(op, "DCP/HTTP/Get", "href"))
            .unwrap_or_else(|| self.ctx.settings.source_base.clone())
    }

    /// The dataset is referenced through the `id` parameter of the feature
    /// type's MetadataURL (a CSW GetRecordById link); without one the feature
    /// type name is used.
    fn dataset_identifier(&self) -> Option<String> {
        xml::nodes(self.feature_type, "MetadataURL")
            .into_iter()
            .filter_map(|n| xml::attr_of(n, "href").or_else(|| xml::text(n, "OnlineResource")))
            .find_map(|href| query_param(&href, "id"))
            .or_else(|| self.name())
    }

    fn service_distribution(&self) -> Distribution {
        let url = self.capabilities_url();
        let separator = if url.contains('?') {
            if url.ends_with(['?', '&']) { "" } else { "&" }
        } else {
            "?"
        };
        let mut dist = Distribution::new(format!("{url}{separator}SERVICE=WFS&REQUEST=GetCapabilities"));
        dist.format = vec!["WFS".to_string()];
        dist.title = xml::text(self.feature_type, "Title");
        dist.description = xml::text(self.feature_type, "Abstract");
        dist.map_layer_names = self.name().into_iter().collect();
        dist.resolved_geometry = self.bounding_box();
        dist
    }
}

impl Mapper for WfsFeatureTypeMapper<'_, '_, '_> {
    fn context(&self) -> &MapperContext<'_> {
        &self.ctx
    }

    fn title(&self) -> String {
        xml::text(self.feature_type, "Title")
            .or_else(|| self.name())
            .unwrap_or_default()
    }

    fn description(&self) -> String {
        xml::text(self.feature_type, "Abstract").unwrap_or_default()
    }

    fn generated_id(&self, ids: &mut IdGenerator) -> String {
        ids.next(&format!("{}#{}", self.ctx.settings.source_base, self.name().unwrap_or_default()))
    }

    fn issued(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn modified_date(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn publisher(&self) -> Option<Agent> {
        xml::text(self.capabilities, "ServiceProvider/ProviderName").map(Agent::organization)
    }

    fn contact_point(&self) -> Option<ContactPoint> {
        let contact = xml::first(self.capabilities, "ServiceProvider/ServiceContact")?;
        let address = "ContactInfo/Address";
        let point = ContactPoint {
            name: xml::text(contact, "IndividualName"),
            has_email: xml::text(contact, &format!("{address}/ElectronicMailAddress")),
            has_telephone: xml::text(contact, "ContactInfo/Phone/Voice"),
            has_street_address: xml::text(contact, &format!("{address}/DeliveryPoint")),
            has_postal_code: xml::text(contact, &format!("{address}/PostalCode")),
            has_locality: xml::text(contact, &format!("{address}/City")),
            has_region: xml::text(contact, &format!("{address}/AdministrativeArea")),
            has_country_name: xml::text(contact, &format!("{address}/Country")),
            has_url: None,
        };
        (!point.is_empty()).then_some(point)
    }

    fn keywords(&self) -> Vec<String> {
        xml::texts(self.feature_type, "Keywords/Keyword")
    }

    fn distributions(&self) -> Vec<Distribution> {
        vec![self.service_distribution()]
    }

    fn bounding_box(&self) -> Option<Geometry> {
        let bbox = xml::first(self.feature_type, "WGS84BoundingBox")?;
        let corner = |name: &str| -> Option<Vec<f64>> {
            xml::text(bbox, name)?
                .split_whitespace()
                .map(|v| v.parse::<f64>().ok())
                .collect::<Option<Vec<_>>>()
                .filter(|v| v.len() == 2)
        };
        let (lower, upper) = (corner("LowerCorner"), corner("UpperCorner"));
        match (lower, upper) {
            (Some(l), Some(u)) => Geometry::bbox(l[0], l[1], u[0], u[1]),
            _ => {
                self.ctx.warn_field("WGS84BoundingBox", "malformed corner coordinates");
                None
            }
        }
    }

    fn spatial(&self) -> Option<Geometry> {
        self.bounding_box()
    }

    fn describes_dataset(&self) -> bool {
        false
    }

    fn coupled_services(&self) -> Vec<ServiceLink> {
        let Some(dataset_identifier) = self.dataset_identifier() else {
            self.ctx.warn_field("Name", "feature type without name or metadata link");
            return Vec::new();
        };
        let distribution = self.service_distribution();
        vec![ServiceLink {
            dataset_identifier,
            service_id: distribution.access_url.clone() + "#" + &self.name().unwrap_or_default(),
            service_type: "WFS".to_string(),
            distribution,
        }]
    }

    fn original_document(&self) -> Option<String> {
        Some(xml::outer_xml(self.feature_type))
    }
}

pub fn map_feature_types(
    raw: &str,
    settings: &MapperSettings,
    factory: &mut IndexDocumentFactory,
    harvest_time: DateTime<Utc>,
    summary: &mut Summary,
) -> Result<Vec<MappedRecord>, MapperError> {
    let doc = Document::parse(raw)?;
    let capabilities = doc.root_element();
    let feature_types = xml::nodes(capabilities, "FeatureTypeList/FeatureType");
    if feature_types.is_empty() {
        return Err(MapperError::MissingRoot { expected: "wfs:FeatureType" });
    }
    let limit = settings.max_records.unwrap_or(usize::MAX);
    Ok(feature_types
        .into_iter()
        .take(limit)
        .map(|feature_type| {
            let mapper =
                WfsFeatureTypeMapper::new(feature_type, capabilities, MapperContext::new(settings, harvest_time));
            map_one(&mapper, factory, summary)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use harvester_core::IndexDocument;

    use super::*;
    use crate::test_support::{fixture, harvest_time, settings};
    use crate::MapperKind;

    fn run(kind: MapperKind, file: &str) -> (Vec<MappedRecord>, Summary) {
        let settings = settings(kind);
        let mut factory = IndexDocumentFactory::default();
        let mut summary = Summary::new("wfs");
        let records = crate::map_source(&fixture(file), &settings, &mut factory, harvest_time(), &mut summary).unwrap();
        (records, summary)
    }

    fn documents(records: Vec<MappedRecord>) -> Vec<IndexDocument> {
        records.into_iter().filter_map(|r| r.document).collect()
    }

    #[test]
    fn xplan_features_use_codelists() {
        let (records, summary) = run(MapperKind::WfsXplan, "wfs/xplan.xml");
        assert_eq!(summary.skipped_docs, vec!["BP_Bereich:GML_bereich_1".to_string()]);
        let docs = documents(records);
        assert_eq!(docs.len(), 2);

        let bp = &docs[0];
        assert_eq!(bp.title, "Altona-Nord 12");
        assert_eq!(bp.resource_identifier.as_deref(), Some("de.hh.bp.altona-nord-12"));
        assert_eq!(bp.anchor_key(), "de.hh.bp.altona-nord-12");
        assert_eq!(bp.plan_type, PlanType::BebauPlan);
        assert_eq!(bp.plan_type_fine.as_deref(), Some("BPlan"));
        assert_eq!(bp.plan_state, PlanState::Festgesetzt);
        assert_eq!(bp.procedure_state, ProcedureState::Abgeschlossen);
        assert_eq!(bp.procedure_type, ProcedureType::NormVerfahren);
        assert_eq!(bp.publisher.as_ref().map(Agent::display_name), Some("Bezirksamt Altona"));
        assert_eq!(bp.spatial_text.as_deref(), Some("Hamburg, Altona-Nord"));
        assert_eq!(bp.process_steps.len(), 2);
        assert!(matches!(bp.spatial, Some(Geometry::Polygon { .. })));
        assert_eq!(bp.bounding_box, Geometry::bbox(9.93, 53.55, 9.96, 53.57));

        let begruendung = &bp.distributions[0];
        assert_eq!(begruendung.doc_type, Some(DocType::Begruendung));
        assert_eq!(begruendung.format, vec!["PDF"]);
        let feature = bp.distributions.last().unwrap();
        assert!(feature.has_format("WFS"));
        assert!(feature.access_url.contains("FEATUREID=GML_bp_altona_nord_12"));
        assert_eq!(bp.extras.metadata.source.raw_data_source.as_deref(), Some(feature.access_url.as_str()));
    }

    #[test]
    fn projected_geometries_are_left_empty() {
        let (records, _) = run(MapperKind::WfsXplan, "wfs/xplan.xml");
        let docs = documents(records);
        let fp = &docs[1];
        assert_eq!(fp.plan_type, PlanType::FlaechennutzPlan);
        assert_eq!(fp.plan_state, PlanState::InAufstellung);
        assert_eq!(fp.spatial, None);
        assert_eq!(fp.bounding_box, None);
        assert!(fp.is_valid());
    }

    #[test]
    fn fis_features_use_flat_attributes() {
        let (records, _) = run(MapperKind::WfsFis, "wfs/fis.xml");
        let docs = documents(records);
        assert_eq!(docs.len(), 1);
        let plan = &docs[0];
        assert_eq!(plan.title, "1-42");
        assert_eq!(plan.plan_state, PlanState::Festgesetzt);
        assert_eq!(plan.plan_type, PlanType::BebauPlan);
        assert_eq!(plan.publisher.as_ref().map(Agent::display_name), Some("Bezirksamt Mitte"));
        assert_eq!(plan.spatial_text.as_deref(), Some("Mitte, Moabit"));
        assert_eq!(plan.distributions.len(), 3);
        assert_eq!(plan.distributions[1].doc_type, Some(DocType::Begruendung));
        assert!(plan.procedure_period.as_ref().unwrap().lte.is_some());
    }

    #[test]
    fn feature_types_couple_to_their_dataset() {
        let (records, _) = run(MapperKind::WfsFeaturetype, "wfs/capabilities.xml");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.document.is_none()));

        let linked = &records[0].services[0];
        assert_eq!(linked.dataset_identifier, "de.hh.bp.altona-nord-12");
        assert_eq!(linked.service_type, "WFS");
        assert!(linked.distribution.access_url.ends_with("REQUEST=GetCapabilities"));
        assert_eq!(linked.distribution.map_layer_names, vec!["app:hh_bebauungsplaene"]);
        assert_eq!(linked.distribution.resolved_geometry, Geometry::bbox(9.93, 53.55, 9.96, 53.57));

        let unlinked = &records[1].services[0];
        assert_eq!(unlinked.dataset_identifier, "app:hh_fnp_aenderungen");
    }

    #[test]
    fn query_params_are_matched_case_insensitively() {
        assert_eq!(
            query_param("https://x.org/csw?REQUEST=GetRecordById&ID=abc", "id").as_deref(),
            Some("abc")
        );
        assert_eq!(query_param("https://x.org/csw", "id"), None);
    }
}
