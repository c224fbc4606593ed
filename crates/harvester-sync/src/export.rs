//! Compact DCAT-AP.PLU RDF/XML rendering of a reconciled document.

use chrono::{DateTime, SecondsFormat, Utc};
use harvester_core::{Agent, DateRange, Distribution, IndexDocument, ProcessStep};

const CODELIST_BASE: &str = "https://registry.gdi-de.org/codelist/de.xleitstelle.xplanung";

const NAMESPACES: &[(&str, &str)] = &[
    ("rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#"),
    ("dcat", "http://www.w3.org/ns/dcat#"),
    ("dct", "http://purl.org/dc/terms/"),
    ("adms", "http://www.w3.org/ns/adms#"),
    ("foaf", "http://xmlns.com/foaf/0.1/"),
    ("locn", "http://www.w3.org/ns/locn#"),
    ("skos", "http://www.w3.org/2004/02/skos/core#"),
    ("plu", "https://specs.diplanung.de/plu/"),
];

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn timestamp(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Default)]
struct Rdf {
    out: String,
    depth: usize,
}

impl Rdf {
    fn line(&mut self, line: &str) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        self.out.push_str(line);
        self.out.push('\n');
    }

    fn open(&mut self, tag: &str) {
        self.line(&format!("<{tag}>"));
        self.depth += 1;
    }

    fn close(&mut self, tag: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.line(&format!("</{tag}>"));
    }

    fn literal(&mut self, tag: &str, value: Option<&str>) {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.line(&format!("<{tag}>{}</{tag}>", escape(value)));
        }
    }

    fn date(&mut self, tag: &str, value: Option<&DateTime<Utc>>) {
        if let Some(value) = value {
            self.line(&format!(
                r#"<{tag} rdf:datatype="http://www.w3.org/2001/XMLSchema#dateTime">{}</{tag}>"#,
                timestamp(value)
            ));
        }
    }

    fn resource(&mut self, tag: &str, uri: &str) {
        self.line(&format!(r#"<{tag} rdf:resource="{}"/>"#, escape(uri)));
    }

    fn code(&mut self, tag: &str, list: &str, value: &str, unknown: bool) {
        if !unknown {
            self.resource(tag, &format!("{CODELIST_BASE}.{list}/{value}"));
        }
    }

    fn agent(&mut self, tag: &str, agent: &Agent) {
        let kind = match agent {
            Agent::Organization(_) => "foaf:Organization",
            Agent::Person(_) => "foaf:Person",
        };
        self.open(tag);
        self.open(kind);
        self.literal("foaf:name", Some(agent.display_name()));
        self.close(kind);
        self.close(tag);
    }

    fn period(&mut self, tag: &str, period: &DateRange) {
        self.open(tag);
        self.open("dct:PeriodOfTime");
        self.date("dcat:startDate", period.gte.as_ref());
        self.date("dcat:endDate", period.lte.as_ref());
        self.close("dct:PeriodOfTime");
        self.close(tag);
    }

    fn distribution(&mut self, dist: &Distribution) {
        self.open("dcat:distribution");
        self.open("dcat:Distribution");
        self.resource("dcat:accessURL", &dist.access_url);
        if let Some(download) = &dist.download_url {
            self.resource("dcat:downloadURL", download);
        }
        self.literal("dct:title", dist.title.as_deref());
        self.literal("dct:description", dist.description.as_deref());
        for format in &dist.format {
            self.literal("dct:format", Some(format));
        }
        if let Some(doc_type) = &dist.doc_type {
            self.code("plu:docType", "docType", doc_type.as_str(), doc_type.is_unknown());
        }
        self.date("dct:issued", dist.issued.as_ref());
        self.date("dct:modified", dist.modified.as_ref());
        self.close("dcat:Distribution");
        self.close("dcat:distribution");
    }

    fn process_step(&mut self, step: &ProcessStep) {
        self.open("plu:processStep");
        self.open("plu:ProcessStep");
        self.literal("dct:identifier", step.identifier.as_deref());
        self.code("plu:processStepType", "processStepType", step.step_type.as_str(), step.step_type.is_unknown());
        if let Some(period) = &step.period {
            self.period("plu:period", period);
        }
        for dist in &step.distributions {
            self.distribution(dist);
        }
        self.close("plu:ProcessStep");
        self.close("plu:processStep");
    }
}

/// Renders `document` as a standalone `rdf:RDF` string holding one
/// `dcat:Dataset`. Only the geometry literals can fail to serialize.
pub fn dcat_ap_plu(document: &IndexDocument) -> Result<String, serde_json::Error> {
    let mut rdf = Rdf::default();
    rdf.line(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let namespaces = NAMESPACES
        .iter()
        .map(|(prefix, uri)| format!(r#"xmlns:{prefix}="{uri}""#))
        .collect::<Vec<_>>()
        .join(" ");
    rdf.open(&format!("rdf:RDF {namespaces}"));
    rdf.line(&format!(
        r#"<dcat:Dataset rdf:about="{}">"#,
        escape(&document.canonical_id())
    ));
    rdf.depth += 1;

    rdf.literal("dct:identifier", Some(&document.identifier));
    if let Some(adms) = &document.adms_identifier {
        rdf.open("adms:identifier");
        rdf.open("adms:Identifier");
        rdf.literal("skos:notation", Some(adms));
        rdf.close("adms:Identifier");
        rdf.close("adms:identifier");
    }
    rdf.literal("dct:title", Some(&document.title));
    rdf.literal("dct:description", Some(&document.description));
    for keyword in &document.keywords {
        rdf.literal("dcat:keyword", Some(keyword));
    }
    rdf.date("dct:issued", document.issued.as_ref());
    rdf.date("dct:modified", document.modified.as_ref());
    if let Some(publisher) = &document.publisher {
        rdf.agent("dct:publisher", publisher);
    }
    for maintainer in &document.maintainers {
        rdf.agent("plu:maintainer", maintainer);
    }
    for contributor in &document.contributors {
        rdf.agent("dct:contributor", contributor);
    }

    rdf.literal("plu:planName", document.plan_name.as_deref());
    rdf.code("plu:planState", "planState", document.plan_state.as_str(), document.plan_state.is_unknown());
    rdf.code("plu:planType", "planType", document.plan_type.as_str(), document.plan_type.is_unknown());
    rdf.literal("plu:planTypeFine", document.plan_type_fine.as_deref());
    rdf.code(
        "plu:procedureState",
        "procedureState",
        document.procedure_state.as_str(),
        document.procedure_state.is_unknown(),
    );
    rdf.code(
        "plu:procedureType",
        "procedureType",
        document.procedure_type.as_str(),
        document.procedure_type.is_unknown(),
    );
    if let Some(period) = &document.procedure_period {
        rdf.period("plu:procedurePeriod", period);
    }
    rdf.date("plu:procedureStartDate", document.procedure_start_date.as_ref());

    let spatial = document.spatial.as_ref().map(serde_json::to_string).transpose()?;
    let bbox = document.bounding_box.as_ref().map(serde_json::to_string).transpose()?;
    let centroid = document.centroid.as_ref().map(serde_json::to_string).transpose()?;
    if spatial.is_some() || bbox.is_some() || centroid.is_some() || document.spatial_text.is_some() {
        rdf.open("dct:spatial");
        rdf.open("dct:Location");
        rdf.literal("locn:geographicName", document.spatial_text.as_deref());
        for (tag, literal) in [("locn:geometry", spatial), ("dcat:bbox", bbox), ("dcat:centroid", centroid)] {
            if let Some(literal) = literal {
                rdf.line(&format!(
                    r#"<{tag} rdf:datatype="https://www.iana.org/assignments/media-types/application/vnd.geo+json">{}</{tag}>"#,
                    escape(&literal)
                ));
            }
        }
        rdf.close("dct:Location");
        rdf.close("dct:spatial");
    }

    for step in &document.process_steps {
        rdf.process_step(step);
    }
    for dist in &document.distributions {
        rdf.distribution(dist);
    }
    if !document.catalog.identifier.is_empty() {
        rdf.resource("dcat:catalog", &document.catalog.identifier);
    }

    rdf.close("dcat:Dataset");
    rdf.close("rdf:RDF");
    Ok(rdf.out)
}

#[cfg(test)]
mod tests {
    use harvester_core::{Geometry, PlanType};

    use super::*;
    use crate::test_support::document;

    #[test]
    fn export_is_well_formed_and_escaped() {
        let mut doc = document("bp-1", "csw");
        doc.title = "Bebauungsplan <Altona> & Umgebung".into();
        doc.plan_type = PlanType::BebauPlan;
        doc.spatial = Some(Geometry::point(9.9, 53.5));
        doc.distributions.push(Distribution::new("https://x.org/plan.pdf?a=1&b=2"));

        let xml = dcat_ap_plu(&doc).unwrap();
        let parsed = roxmltree::Document::parse(&xml).unwrap();
        let dataset = parsed
            .descendants()
            .find(|n| n.has_tag_name(("http://www.w3.org/ns/dcat#", "Dataset")))
            .unwrap();
        assert_eq!(dataset.attribute(("http://www.w3.org/1999/02/22-rdf-syntax-ns#", "about")), Some("hh/bp-1"));
        assert!(xml.contains("Bebauungsplan &lt;Altona&gt; &amp; Umgebung"));
        assert!(xml.contains("planType/bebauPlan"));
        assert!(xml.contains("&quot;type&quot;:&quot;Point&quot;"));
        assert!(!xml.contains("plu:planState"));
    }
}
