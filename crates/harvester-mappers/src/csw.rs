//! CSW / ISO 19139 (`gmd:MD_Metadata`) mapper.

use chrono::{DateTime, Utc};
use harvester_core::{
    Agent, ContactPoint, DateRange, Distribution, Geometry, PlanType, Summary,
};
use once_cell::unsync::OnceCell;
use roxmltree::{Document, Node};

use crate::{
    codelist, gml, guess_format, map_one, parse_date, xml, IdGenerator, IndexDocumentFactory,
    MappedRecord, Mapper, MapperContext, MapperError, MapperSettings,
};

const IDENT: &str = "identificationInfo/*";
const CITATION: &str = "identificationInfo/*/citation/CI_Citation";
const EXTENT: &str = "identificationInfo/*/extent/EX_Extent";

/// `gmd:CI_ResponsibleParty`, flattened.
#[derive(Debug, Clone, PartialEq)]
struct Party {
    role: String,
    organisation: Option<String>,
    individual: Option<String>,
    contact: ContactPoint,
}

impl Party {
    fn parse(node: Node<'_, '_>) -> Self {
        let info = "contactInfo/CI_Contact";
        let address = "contactInfo/CI_Contact/address/CI_Address";
        let organisation = xml::text(node, "organisationName/CharacterString");
        let individual = xml::text(node, "individualName/CharacterString");
        Party {
            role: xml::attr(node, "role/CI_RoleCode", "codeListValue").unwrap_or_default(),
            contact: ContactPoint {
                name: organisation.clone().or_else(|| individual.clone()),
                has_email: xml::text(node, &format!("{address}/electronicMailAddress/CharacterString")),
                has_telephone: xml::text(node, &format!("{info}/phone/CI_Telephone/voice/CharacterString")),
                has_street_address: xml::text(node, &format!("{address}/deliveryPoint/CharacterString")),
                has_postal_code: xml::text(node, &format!("{address}/postalCode/CharacterString")),
                has_locality: xml::text(node, &format!("{address}/city/CharacterString")),
                has_region: xml::text(node, &format!("{address}/administrativeArea/CharacterString")),
                has_country_name: xml::text(node, &format!("{address}/country/CharacterString")),
                has_url: xml::text(node, &format!("{info}/onlineResource/CI_OnlineResource/linkage/URL")),
            },
            organisation,
            individual,
        }
    }

    fn agent(&self) -> Option<Agent> {
        let homepage = self.contact.has_url.clone();
        match (&self.organisation, &self.individual) {
            (Some(org), _) => Some(Agent::organization(org).with_homepage(homepage)),
            (None, Some(person)) => Some(Agent::person(person).with_homepage(homepage)),
            (None, None) => None,
        }
    }
}

pub struct CswMapper<'a, 'i, 's> {
    record: Node<'a, 'i>,
    ctx: MapperContext<'s>,
    parties: OnceCell<Vec<Party>>,
    description: OnceCell<String>,
    distributions: OnceCell<Vec<Distribution>>,
    file_identifier: OnceCell<Option<String>>,
}

impl<'a, 'i, 's> CswMapper<'a, 'i, 's> {
    pub fn new(record: Node<'a, 'i>, ctx: MapperContext<'s>) -> Self {
        Self {
            record,
            ctx,
            parties: OnceCell::new(),
            description: OnceCell::new(),
            distributions: OnceCell::new(),
            file_identifier: OnceCell::new(),
        }
    }

    fn file_identifier(&self) -> Option<String> {
        self.file_identifier
            .get_or_init(|| xml::text(self.record, "fileIdentifier/CharacterString"))
            .clone()
    }

    fn parties(&self) -> &[Party] {
        self.parties.get_or_init(|| {
            xml::nodes(self.record, &format!("{IDENT}/pointOfContact/CI_ResponsibleParty"))
                .into_iter()
                .map(Party::parse)
                .collect()
        })
    }

    fn agents_with_roles(&self, roles: &[&str]) -> Vec<Agent> {
        let mut out: Vec<Agent> = Vec::new();
        for party in self.parties().iter().filter(|p| roles.contains(&p.role.as_str())) {
            if let Some(agent) = party.agent() {
                if !out.contains(&agent) {
                    out.push(agent);
                }
            }
        }
        out
    }

    fn citation_date(&self, types: &[&str]) -> Option<DateTime<Utc>> {
        xml::nodes(self.record, &format!("{CITATION}/date/CI_Date"))
            .into_iter()
            .filter(|d| {
                xml::attr(*d, "dateType/CI_DateTypeCode", "codeListValue")
                    .is_some_and(|t| types.contains(&t.as_str()))
            })
            .find_map(|d| {
                let raw = xml::text(d, "date/Date").or_else(|| xml::text(d, "date/DateTime"))?;
                let parsed = parse_date(&raw);
                if parsed.is_none() {
                    self.ctx.warn_field("issued", format!("unparseable citation date `{raw}`"));
                }
                parsed
            })
    }

    fn bbox_value(&self, node: Node<'_, '_>, name: &str) -> Option<f64> {
        let raw = xml::text(node, &format!("{name}/Decimal"))?;
        match raw.parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.ctx.warn_field("bounding_box", format!("{name} is not a number: `{raw}`"));
                None
            }
        }
    }

    fn formats(&self) -> Vec<String> {
        xml::texts(
            self.record,
            "distributionInfo/MD_Distribution/distributionFormat/MD_Format/name/CharacterString",
        )
    }
}

impl Mapper for CswMapper<'_, '_, '_> {
    fn context(&self) -> &MapperContext<'_> {
        &self.ctx
    }

    fn title(&self) -> String {
        xml::text(self.record, &format!("{CITATION}/title/CharacterString")).unwrap_or_default()
    }

    fn description(&self) -> String {
        self.description
            .get_or_init(|| {
                xml::text(self.record, &format!("{IDENT}/abstract/CharacterString")).unwrap_or_else(|| {
                    self.ctx.invalidate("Missing abstract");
                    String::new()
                })
            })
            .clone()
    }

    fn generated_id(&self, ids: &mut IdGenerator) -> String {
        match self.file_identifier() {
            Some(id) => id,
            None => {
                self.ctx.invalidate("Missing fileIdentifier");
                ids.next(&self.title())
            }
        }
    }

    fn resource_identifier(&self) -> Option<String> {
        xml::text(self.record, &format!("{CITATION}/identifier/*/code/CharacterString"))
    }

    fn raw_data_source(&self) -> Option<String> {
        let id = self.file_identifier()?;
        let base = &self.ctx.settings.source_base;
        Some(format!(
            "{base}?REQUEST=GetRecordById&SERVICE=CSW&VERSION=2.0.2&ElementSetName=full&outputSchema=http://www.isotc211.org/2005/gmd&Id={id}"
        ))
    }

    fn issued(&self) -> Option<DateTime<Utc>> {
        self.citation_date(&["publication", "creation"])
    }

    fn modified_date(&self) -> Option<DateTime<Utc>> {
        self.citation_date(&["revision"]).or_else(|| {
            xml::text(self.record, "dateStamp/DateTime")
                .or_else(|| xml::text(self.record, "dateStamp/Date"))
                .and_then(|raw| parse_date(&raw))
        })
    }

    fn publisher(&self) -> Option<Agent> {
        self.agents_with_roles(&["publisher"])
            .into_iter()
            .next()
            .or_else(|| self.parties().iter().find_map(Party::agent))
    }

    fn maintainers(&self) -> Vec<Agent> {
        self.agents_with_roles(&["custodian", "pointOfContact"])
    }

    fn contributors(&self) -> Vec<Agent> {
        self.agents_with_roles(&["author", "originator", "principalInvestigator"])
    }

    fn contact_point(&self) -> Option<ContactPoint> {
        let contact = xml::first(self.record, "contact/CI_ResponsibleParty").map(Party::parse)?;
        (!contact.contact.is_empty()).then_some(contact.contact)
    }

    fn keywords(&self) -> Vec<String> {
        xml::texts(
            self.record,
            &format!("{IDENT}/descriptiveKeywords/MD_Keywords/keyword/CharacterString"),
        )
    }

    fn distributions(&self) -> Vec<Distribution> {
        self.distributions
            .get_or_init(|| {
                let default_formats = self.formats();
                let resources = xml::nodes(
                    self.record,
                    "distributionInfo/MD_Distribution/transferOptions/MD_DigitalTransferOptions/onLine/CI_OnlineResource",
                );
                let mut out = Vec::with_capacity(resources.len());
                for resource in resources {
                    let Some(url) = xml::text(resource, "linkage/URL") else {
                        self.ctx.warn_field("distributions", "online resource without linkage");
                        continue;
                    };
                    let protocol = xml::text(resource, "protocol/CharacterString");
                    let mut format = guess_format(&url, protocol.as_deref());
                    if format.is_empty() {
                        format = default_formats.clone();
                    }
                    let is_download = xml::attr(resource, "function/CI_OnLineFunctionCode", "codeListValue")
                        .is_some_and(|f| f == "download");
                    let mut dist = Distribution::new(url.clone());
                    dist.format = format;
                    dist.download_url = is_download.then_some(url);
                    dist.title = xml::text(resource, "name/CharacterString");
                    dist.description = xml::text(resource, "description/CharacterString");
                    out.push(dist);
                }
                if out.is_empty() {
                    self.ctx.invalidate("No distributions");
                }
                out
            })
            .clone()
    }

    fn bounding_box(&self) -> Option<Geometry> {
        let bbox = xml::first(
            self.record,
            &format!("{EXTENT}/geographicElement/EX_GeographicBoundingBox"),
        )?;
        let west = self.bbox_value(bbox, "westBoundLongitude")?;
        let east = self.bbox_value(bbox, "eastBoundLongitude")?;
        let south = self.bbox_value(bbox, "southBoundLatitude")?;
        let north = self.bbox_value(bbox, "northBoundLatitude")?;
        Geometry::bbox(west, south, east, north)
    }

    fn spatial(&self) -> Option<Geometry> {
        xml::first(self.record, &format!("{EXTENT}/geographicElement/EX_BoundingPolygon/polygon"))
            .and_then(gml::read_geometry)
            .or_else(|| self.bounding_box())
    }

    fn spatial_text(&self) -> Option<String> {
        xml::text(self.record, &format!("{EXTENT}/description/CharacterString")).or_else(|| {
            xml::text(
                self.record,
                &format!("{EXTENT}/geographicElement/EX_GeographicDescription/geographicIdentifier/MD_Identifier/code/CharacterString"),
            )
        })
    }

    fn plan_name(&self) -> Option<String> {
        crate::text_or_none(self.title())
    }

    fn plan_type(&self) -> PlanType {
        let keywords = self.keywords();
        codelist::plan_type_from_keywords(keywords.iter().map(String::as_str))
    }

    fn procedure_period(&self) -> Option<DateRange> {
        let period = xml::first(
            self.record,
            &format!("{EXTENT}/temporalElement/EX_TemporalExtent/extent/TimePeriod"),
        )?;
        DateRange::new(
            xml::text(period, "beginPosition").and_then(|v| parse_date(&v)),
            xml::text(period, "endPosition").and_then(|v| parse_date(&v)),
        )
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
    let records = xml::descendants(doc.root_element(), "MD_Metadata").collect::<Vec<_>>();
    if records.is_empty() {
        return Err(MapperError::MissingRoot { expected: "gmd:MD_Metadata" });
    }
    let limit = settings.max_records.unwrap_or(usize::MAX);
    Ok(records
        .into_iter()
        .take(limit)
        .map(|record| {
            let mapper = CswMapper::new(record, MapperContext::new(settings, harvest_time));
            map_one(&mapper, factory, summary)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use harvester_core::{Agent, PlanType, SourceType};

    use super::*;
    use crate::test_support::{fixture, harvest_time, settings};
    use crate::MapperKind;

    fn mapped() -> Vec<MappedRecord> {
        let settings = settings(MapperKind::Csw);
        let mut factory = IndexDocumentFactory::default();
        let mut summary = Summary::new("csw");
        map_records(&fixture("csw/records.xml"), &settings, &mut factory, harvest_time(), &mut summary).unwrap()
    }

    #[test]
    fn maps_core_fields_of_a_plan_record() {
        let records = mapped();
        assert_eq!(records.len(), 2);
        let doc = records[0].document.as_ref().unwrap();
        assert_eq!(doc.identifier, "7a3b1f2e-csw-0001");
        assert_eq!(doc.title, "Bebauungsplan Altona-Nord 12");
        assert_eq!(doc.resource_identifier.as_deref(), Some("de.hh.bp.altona-nord-12"));
        assert_eq!(doc.anchor_key(), "de.hh.bp.altona-nord-12");
        assert_eq!(doc.source_type(), &SourceType::Csw);
        assert_eq!(doc.plan_type, PlanType::BebauPlan);
        assert_eq!(doc.publisher, Some(Agent::organization("Bezirksamt Altona").with_homepage(Some("https://www.hamburg.de/altona".into()))));
        assert_eq!(doc.keywords, vec!["Bebauungsplan", "Bauleitplanung"]);
        assert!(doc.is_valid());
        assert!(records[0].original_document.as_deref().unwrap().contains("7a3b1f2e-csw-0001"));
    }

    #[test]
    fn extracts_distributions_extent_and_contact() {
        let records = mapped();
        let doc = records[0].document.as_ref().unwrap();
        assert_eq!(doc.distributions.len(), 2);
        assert_eq!(doc.distributions[0].format, vec!["WMS"]);
        assert_eq!(doc.distributions[1].format, vec!["PDF"]);
        assert_eq!(doc.distributions[1].download_url.as_deref(), Some("https://www.hamburg.de/plaene/altona-nord-12.pdf"));
        assert_eq!(doc.bounding_box, Geometry::bbox(9.93, 53.55, 9.96, 53.57));
        assert_eq!(doc.spatial, doc.bounding_box);
        assert_eq!(doc.spatial_text.as_deref(), Some("Altona-Nord"));
        let contact = doc.contact_point.as_ref().unwrap();
        assert_eq!(contact.has_email.as_deref(), Some("geodaten@altona.hamburg.de"));
        assert_eq!(contact.has_locality.as_deref(), Some("Hamburg"));
        let period = doc.procedure_period.as_ref().unwrap();
        assert!(period.gte.is_some() && period.lte.is_none());
        assert_eq!(doc.procedure_start_date, period.gte);
        assert!(doc
            .extras
            .metadata
            .source
            .raw_data_source
            .as_deref()
            .unwrap()
            .ends_with("Id=7a3b1f2e-csw-0001"));
    }

    #[test]
    fn missing_abstract_and_distributions_invalidate_without_failing() {
        let records = mapped();
        let doc = records[1].document.as_ref().unwrap();
        assert!(!doc.is_valid());
        assert_eq!(
            doc.extras.metadata.harvesting_errors,
            vec!["Missing abstract".to_string(), "No distributions".to_string()]
        );
        assert_eq!(doc.description, "");
        assert_eq!(doc.bounding_box, None);
    }

    #[test]
    fn documents_without_records_are_rejected() {
        let settings = settings(MapperKind::Csw);
        let mut factory = IndexDocumentFactory::default();
        let mut summary = Summary::new("csw");
        let err = map_records("<csw:GetRecordsResponse xmlns:csw=\"urn:csw\"/>", &settings, &mut factory, harvest_time(), &mut summary)
            .unwrap_err();
        assert!(matches!(err, MapperError::MissingRoot { .. }));
    }
}
