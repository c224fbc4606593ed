//! DCAT-AP.PLU (RDF/XML `dcat:Dataset`) mapper.

use chrono::{DateTime, Utc};
use harvester_core::{
    Agent, ContactPoint, DateRange, DocType, Distribution, Geometry, PlanState, PlanType,
    ProcedureState, ProcedureType, ProcessStep, ProcessStepType, Summary,
};
use once_cell::unsync::OnceCell;
use roxmltree::{Document, Node};

use crate::{
    map_one, parse_date, text_or_none, xml, IdGenerator, IndexDocumentFactory, MappedRecord,
    Mapper, MapperContext, MapperError, MapperSettings,
};

pub struct DcatApPluMapper<'a, 'i, 's> {
    record: Node<'a, 'i>,
    ctx: MapperContext<'s>,
    description: OnceCell<String>,
    distributions: OnceCell<Vec<Distribution>>,
    contact_point: OnceCell<Option<ContactPoint>>,
}

fn strip_mailto(value: String) -> String {
    value
        .strip_prefix("mailto:")
        .or_else(|| value.strip_prefix("tel:"))
        .map(ToString::to_string)
        .unwrap_or(value)
}

fn agent(node: Node<'_, '_>) -> Option<Agent> {
    let homepage = xml::resource_or_text(node, "*/homepage");
    let agent_type = xml::resource_or_text(node, "*/type");
    if let Some(name) = xml::text(node, "Organization/name") {
        let mut org = Agent::organization(name).with_homepage(homepage);
        if let Agent::Organization(o) = &mut org {
            o.agent_type = agent_type;
        }
        return Some(org);
    }
    let name = xml::text(node, "Person/name").or_else(|| xml::text(node, "*/name"))?;
    let mut person = Agent::person(name).with_homepage(homepage);
    if let Agent::Person(p) = &mut person {
        p.agent_type = agent_type;
    }
    Some(person)
}

fn period(node: Option<Node<'_, '_>>) -> Option<DateRange> {
    let node = node?;
    DateRange::new(
        xml::text(node, "PeriodOfTime/startDate").and_then(|v| parse_date(&v)),
        xml::text(node, "PeriodOfTime/endDate").and_then(|v| parse_date(&v)),
    )
}

impl<'a, 'i, 's> DcatApPluMapper<'a, 'i, 's> {
    pub fn new(record: Node<'a, 'i>, ctx: MapperContext<'s>) -> Self {
        Self {
            record,
            ctx,
            description: OnceCell::new(),
            distributions: OnceCell::new(),
            contact_point: OnceCell::new(),
        }
    }

    fn distribution(&self, node: Node<'_, '_>) -> Option<Distribution> {
        let Some(access_url) = xml::resource_or_text(node, "accessURL") else {
            self.ctx.warn_field("distributions", "distribution without accessURL");
            return None;
        };
        let mut dist = Distribution::new(access_url);
        dist.format = xml::nodes(node, "format")
            .into_iter()
            .filter_map(|f| xml::attr_of(f, "resource").or_else(|| xml::node_text(f)))
            .map(|f| f.rsplit('/').next().unwrap_or(&f).to_string())
            .collect();
        dist.download_url = xml::resource_or_text(node, "downloadURL");
        dist.title = xml::text(node, "title");
        dist.description = xml::text(node, "description");
        dist.issued = self.date(node, "issued");
        dist.modified = self.date(node, "modified");
        dist.temporal = period(xml::first(node, "temporal"));
        dist.map_layer_names = xml::texts(node, "mapLayerNames");
        dist.doc_type = xml::resource_or_text(node, "docType").map(|d| DocType::from_code(&d));
        Some(dist)
    }

    fn date(&self, node: Node<'_, '_>, path: &str) -> Option<DateTime<Utc>> {
        let raw = xml::text(node, path)?;
        let parsed = parse_date(&raw);
        if parsed.is_none() {
            self.ctx.warn_field(path, format!("unparseable date `{raw}`"));
        }
        parsed
    }

    fn geometry_literal(&self, path: &str) -> Option<Geometry> {
        let literal = xml::text(self.record, path)?;
        match serde_json::from_str::<Geometry>(&literal) {
            Ok(geometry) => Some(geometry),
            Err(err) => {
                self.ctx.warn_field(path, format!("invalid GeoJSON literal: {err}"));
                None
            }
        }
    }

    fn code(&self, path: &str) -> Option<String> {
        xml::resource_or_text(self.record, path)
    }
}

impl Mapper for DcatApPluMapper<'_, '_, '_> {
    fn context(&self) -> &MapperContext<'_> {
        &self.ctx
    }

    fn title(&self) -> String {
        xml::text(self.record, "title").unwrap_or_default()
    }

    fn description(&self) -> String {
        self.description
            .get_or_init(|| {
                xml::text(self.record, "description").unwrap_or_else(|| {
                    self.ctx.invalidate("Missing description");
                    String::new()
                })
            })
            .clone()
    }

    fn generated_id(&self, ids: &mut IdGenerator) -> String {
        // dct:identifier and adms:identifier share a local name; only the
        // former is a plain literal.
        xml::nodes(self.record, "identifier")
            .into_iter()
            .filter(|n| !n.children().any(|c| c.is_element()))
            .find_map(xml::node_text)
            .or_else(|| xml::attr_of(self.record, "about"))
            .unwrap_or_else(|| ids.next(&self.title()))
    }

    fn adms_identifier(&self) -> Option<String> {
        xml::text(self.record, "identifier/Identifier/notation")
            .or_else(|| xml::text(self.record, "identifier/Identifier/notion"))
    }

    fn resource_identifier(&self) -> Option<String> {
        xml::text(self.record, "resourceIdentifier")
    }

    fn raw_data_source(&self) -> Option<String> {
        xml::attr_of(self.record, "about")
    }

    fn issued(&self) -> Option<DateTime<Utc>> {
        self.date(self.record, "issued")
    }

    fn modified_date(&self) -> Option<DateTime<Utc>> {
        self.date(self.record, "modified")
    }

    fn publisher(&self) -> Option<Agent> {
        xml::first(self.record, "publisher").and_then(agent)
    }

    fn maintainers(&self) -> Vec<Agent> {
        xml::nodes(self.record, "maintainer").into_iter().filter_map(agent).collect()
    }

    fn contributors(&self) -> Vec<Agent> {
        xml::nodes(self.record, "contributor").into_iter().filter_map(agent).collect()
    }

    fn contact_point(&self) -> Option<ContactPoint> {
        self.contact_point
            .get_or_init(|| {
                let node = xml::first(self.record, "contactPoint/*")?;
                let address = "hasAddress/Address";
                let contact = ContactPoint {
                    name: xml::text(node, "fn"),
                    has_email: xml::resource_or_text(node, "hasEmail").map(strip_mailto),
                    has_telephone: xml::resource_or_text(node, "hasTelephone").map(strip_mailto),
                    has_street_address: xml::text(node, &format!("{address}/street-address")),
                    has_postal_code: xml::text(node, &format!("{address}/postal-code")),
                    has_locality: xml::text(node, &format!("{address}/locality")),
                    has_region: xml::text(node, &format!("{address}/region")),
                    has_country_name: xml::text(node, &format!("{address}/country-name")),
                    has_url: xml::resource_or_text(node, "hasURL"),
                };
                (!contact.is_empty()).then_some(contact)
            })
            .clone()
    }

    fn keywords(&self) -> Vec<String> {
        xml::texts(self.record, "keyword")
    }

    fn distributions(&self) -> Vec<Distribution> {
        self.distributions
            .get_or_init(|| {
                let out = xml::nodes(self.record, "distribution/Distribution")
                    .into_iter()
                    .filter_map(|d| self.distribution(d))
                    .collect::<Vec<_>>();
                if out.is_empty() {
                    self.ctx.invalidate("No distributions");
                }
                out
            })
            .clone()
    }

    fn bounding_box(&self) -> Option<Geometry> {
        self.geometry_literal("spatial/Location/bbox")
    }

    fn spatial(&self) -> Option<Geometry> {
        self.geometry_literal("spatial/Location/geometry")
    }

    fn centroid(&self) -> Option<Geometry> {
        self.geometry_literal("spatial/Location/centroid")
    }

    fn spatial_text(&self) -> Option<String> {
        xml::text(self.record, "spatial/Location/geographicName")
    }

    fn plan_name(&self) -> Option<String> {
        xml::text(self.record, "planName")
    }

    fn plan_state(&self) -> PlanState {
        self.code("planState").map(|c| PlanState::from_code(&c)).unwrap_or_default()
    }

    fn plan_type(&self) -> PlanType {
        self.code("planType").map(|c| PlanType::from_code(&c)).unwrap_or_default()
    }

    fn plan_type_fine(&self) -> Option<String> {
        self.code("planTypeFine")
            .and_then(|c| text_or_none(c.rsplit('/').next().unwrap_or(&c)))
    }

    fn procedure_state(&self) -> ProcedureState {
        self.code("procedureState").map(|c| ProcedureState::from_code(&c)).unwrap_or_default()
    }

    fn procedure_type(&self) -> ProcedureType {
        self.code("procedureType").map(|c| ProcedureType::from_code(&c)).unwrap_or_default()
    }

    fn procedure_period(&self) -> Option<DateRange> {
        period(xml::first(self.record, "procedurePeriod"))
    }

    fn process_steps(&self) -> Vec<ProcessStep> {
        xml::nodes(self.record, "processStep/ProcessStep")
            .into_iter()
            .map(|step| ProcessStep {
                identifier: xml::text(step, "identifier"),
                step_type: xml::resource_or_text(step, "processStepType")
                    .map(|c| ProcessStepType::from_code(&c))
                    .unwrap_or_default(),
                distributions: xml::nodes(step, "distribution/Distribution")
                    .into_iter()
                    .filter_map(|d| self.distribution(d))
                    .collect(),
                period: period(xml::first(step, "temporal")),
            })
            .collect()
    }

    fn original_document(&self) -> Option<String> {
        Some(xml::outer_xml(self.record))
    }
}

pub fn map_records(
    raw: &str,
    settings: &MapperSettings,
    factory: &mut IndexDocumentFactory,
    harvest_time: DateTime<Utc>,
    summary: &mut Summary,
) -> Result<Vec<MappedRecord>, MapperError> {
    let doc = Document::parse(raw)?;
    let records = xml::descendants(doc.root_element(), "Dataset").collect::<Vec<_>>();
    if records.is_empty() {
        return Err(MapperError::MissingRoot { expected: "dcat:Dataset" });
    }
    let limit = settings.max_records.unwrap_or(usize::MAX);
    Ok(records
        .into_iter()
        .take(limit)
        .map(|record| {
            let mapper = DcatApPluMapper::new(record, MapperContext::new(settings, harvest_time));
            map_one(&mapper, factory, summary)
        })
        .collect())
}
