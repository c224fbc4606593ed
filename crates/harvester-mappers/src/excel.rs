//! Sparse spreadsheet mapper.
//!
//! Sheets arrive as JSON exports: a header row plus data rows of cells
//! (string, number or null). Rows may be shorter than the header. Columns are
//! resolved by header name, not by position.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use harvester_core::{Agent, ContactPoint, DateRange, Distribution, Geometry, PlanState, PlanType, Summary};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    codelist, guess_format, map_one, parse_date, text_or_none, IdGenerator, IndexDocumentFactory,
    MappedRecord, Mapper, MapperContext, MapperError, MapperSettings,
};

#[derive(Debug, Deserialize)]
pub struct Sheet {
    #[serde(default)]
    pub header: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

/// Column names as they appear in the header row.
mod col {
    pub const IDENTIFIER: &str = "Identifier";
    pub const TITLE: &str = "Titel";
    pub const DESCRIPTION: &str = "Beschreibung";
    pub const PUBLISHER: &str = "Herausgeber";
    pub const KEYWORDS: &str = "Schlagworte";
    pub const URL: &str = "URL";
    pub const FORMAT: &str = "Dateiformat";
    pub const FROM: &str = "Zeitraum von";
    pub const TO: &str = "Zeitraum bis";
    pub const ISSUED: &str = "Veröffentlicht";
    pub const MODIFIED: &str = "Aktualisiert";
    pub const PLACE: &str = "Räumlicher Bezug";
    pub const BBOX: &str = "Bounding Box";
    pub const EMAIL: &str = "Kontakt E-Mail";
    pub const PLAN_TYPE: &str = "Plantyp";
    pub const PLAN_STATE: &str = "Planstatus";
}

fn list(value: &str) -> Vec<String> {
    value
        .split([',', ';', '\n'])
        .filter_map(text_or_none)
        .collect()
}

/// Spreadsheet day serial (days since 1899-12-30) to a UTC midnight.
fn serial_date(serial: f64) -> Option<DateTime<Utc>> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = epoch.checked_add_signed(Duration::days(serial.trunc() as i64))?;
    date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive))
}

pub struct ExcelMapper<'r, 's> {
    row: &'r [Value],
    columns: &'r HashMap<String, usize>,
    ctx: MapperContext<'s>,
}

impl<'r, 's> ExcelMapper<'r, 's> {
    pub fn new(row: &'r [Value], columns: &'r HashMap<String, usize>, ctx: MapperContext<'s>) -> Self {
        Self { row, columns, ctx }
    }

    fn raw(&self, column: &str) -> Option<&Value> {
        self.columns.get(column).and_then(|idx| self.row.get(*idx))
    }

    fn cell(&self, column: &str) -> Option<String> {
        match self.raw(column)? {
            Value::String(s) => text_or_none(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn date(&self, column: &str) -> Option<DateTime<Utc>> {
        let parsed = match self.raw(column)? {
            Value::Number(n) => n.as_f64().and_then(serial_date),
            Value::String(s) if s.trim().is_empty() => return None,
            Value::String(s) => parse_date(s),
            _ => return None,
        };
        if parsed.is_none() {
            self.ctx.warn_field(column, "unparseable date cell");
        }
        parsed
    }
}

impl Mapper for ExcelMapper<'_, '_> {
    fn context(&self) -> &MapperContext<'_> {
        &self.ctx
    }

    fn title(&self) -> String {
        self.cell(col::TITLE).unwrap_or_else(|| {
            self.ctx.invalidate("Missing title");
            String::new()
        })
    }

    fn description(&self) -> String {
        self.cell(col::DESCRIPTION).unwrap_or_default()
    }

    fn generated_id(&self, ids: &mut IdGenerator) -> String {
        self.cell(col::IDENTIFIER)
            .unwrap_or_else(|| ids.next(&self.cell(col::TITLE).unwrap_or_default()))
    }

    fn issued(&self) -> Option<DateTime<Utc>> {
        self.date(col::ISSUED)
    }

    fn modified_date(&self) -> Option<DateTime<Utc>> {
        self.date(col::MODIFIED)
    }

    fn publisher(&self) -> Option<Agent> {
        self.cell(col::PUBLISHER).map(Agent::organization)
    }

    fn contact_point(&self) -> Option<ContactPoint> {
        let email = self.cell(col::EMAIL)?;
        Some(ContactPoint {
            name: self.cell(col::PUBLISHER),
            has_email: Some(email),
            ..Default::default()
        })
    }

    fn keywords(&self) -> Vec<String> {
        self.cell(col::KEYWORDS).map(|k| list(&k)).unwrap_or_default()
    }

    /// One distribution per listed URL; formats pair up by position and are
    /// guessed from the URL where the format cell runs short.
    fn distributions(&self) -> Vec<Distribution> {
        let urls = self
            .cell(col::URL)
            .map(|cell| cell.split_whitespace().flat_map(list).collect::<Vec<_>>())
            .unwrap_or_default();
        let formats = self.cell(col::FORMAT).map(|f| list(&f)).unwrap_or_default();
        urls.into_iter()
            .enumerate()
            .map(|(idx, url)| {
                let mut dist = Distribution::new(url.clone());
                dist.format = formats
                    .get(idx)
                    .map(|f| vec![f.to_ascii_uppercase()])
                    .unwrap_or_else(|| guess_format(&url, None));
                dist
            })
            .collect()
    }

    fn bounding_box(&self) -> Option<Geometry> {
        let cell = self.cell(col::BBOX)?;
        let values = cell
            .split([',', ';', ' '])
            .filter(|v| !v.is_empty())
            .map(|v| v.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>();
        match values.as_deref() {
            Some([west, south, east, north]) => Geometry::bbox(*west, *south, *east, *north),
            _ => {
                self.ctx.warn_field(col::BBOX, format!("expected `west,south,east,north`, got `{cell}`"));
                None
            }
        }
    }

    fn spatial(&self) -> Option<Geometry> {
        self.bounding_box()
    }

    fn spatial_text(&self) -> Option<String> {
        self.cell(col::PLACE)
    }

    fn plan_name(&self) -> Option<String> {
        self.cell(col::TITLE)
    }

    fn plan_state(&self) -> PlanState {
        self.cell(col::PLAN_STATE)
            .map(|s| PlanState::from_code(&s))
            .unwrap_or_default()
    }

    fn plan_type(&self) -> PlanType {
        match self.cell(col::PLAN_TYPE) {
            Some(value) => match PlanType::from_code(&value) {
                PlanType::Unknown => codelist::plan_type_from_keywords([value.as_str()]),
                known => known,
            },
            None => PlanType::Unknown,
        }
    }

    fn procedure_state(&self) -> harvester_core::ProcedureState {
        codelist::procedure_state_for(self.plan_state())
    }

    fn procedure_period(&self) -> Option<DateRange> {
        DateRange::new(self.date(col::FROM), self.date(col::TO))
    }

    fn original_document(&self) -> Option<String> {
        let object = self
            .columns
            .iter()
            .filter_map(|(name, idx)| self.row.get(*idx).map(|v| (name.clone(), v.clone())))
            .filter(|(_, v)| !v.is_null())
            .collect::<serde_json::Map<_, _>>();
        serde_json::to_string(&object).ok()
    }
}

pub fn map_rows(
    raw: &str,
    settings: &MapperSettings,
    factory: &mut IndexDocumentFactory,
    harvest_time: DateTime<Utc>,
    summary: &mut Summary,
) -> Result<Vec<MappedRecord>, MapperError> {
    let sheet: Sheet = serde_json::from_str(raw)?;
    if sheet.header.iter().all(|h| h.trim().is_empty()) {
        return Err(MapperError::MissingHeader);
    }
    let columns = sheet
        .header
        .iter()
        .enumerate()
        .filter_map(|(idx, name)| text_or_none(name).map(|name| (name, idx)))
        .collect::<HashMap<_, _>>();
    let limit = settings.max_records.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    for (line, row) in sheet.rows.iter().enumerate() {
        if out.len() >= limit {
            break;
        }
        if row.iter().all(|cell| cell.is_null() || cell.as_str().is_some_and(|s| s.trim().is_empty())) {
            summary.skipped_docs.push(format!("row {}", line + 2));
            continue;
        }
        let mapper = ExcelMapper::new(row, &columns, MapperContext::new(settings, harvest_time));
        out.push(map_one(&mapper, factory, summary));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;
    use harvester_core::{IndexDocument, ProcedureState};

    use super::*;
    use crate::test_support::{fixture, harvest_time, settings};
    use crate::MapperKind;

    fn documents() -> (Vec<IndexDocument>, Summary) {
        let settings = settings(MapperKind::ExcelSparse);
        let mut factory = IndexDocumentFactory::default();
        let mut summary = Summary::new("excel");
        let records =
            map_rows(&fixture("excel/sheet.json"), &settings, &mut factory, harvest_time(), &mut summary).unwrap();
        (records.into_iter().filter_map(|r| r.document).collect(), summary)
    }

    #[test]
    fn columns_resolve_by_header_name() {
        let (docs, summary) = documents();
        assert_eq!(docs.len(), 2);
        assert_eq!(summary.skipped_docs, vec!["row 3".to_string()]);

        let first = &docs[0];
        assert_eq!(first.identifier, "bp-harburg-70");
        assert_eq!(first.keywords, vec!["Bebauungsplan", "Harburg"]);
        assert_eq!(first.plan_type, PlanType::BebauPlan);
        assert_eq!(first.plan_state, PlanState::Festgesetzt);
        assert_eq!(first.procedure_state, ProcedureState::Abgeschlossen);
        assert_eq!(first.distributions.len(), 2);
        assert_eq!(first.distributions[0].format, vec!["PDF"]);
        assert_eq!(first.distributions[1].format, vec!["WMS"]);
        assert_eq!(first.bounding_box, Geometry::bbox(9.95, 53.44, 9.99, 53.47));
        assert_eq!(first.contact_point.as_ref().and_then(|c| c.has_email.as_deref()), Some("planung@harburg.hamburg.de"));
        assert_eq!(first.issued.map(|d| (d.year(), d.month(), d.day())), Some((2022, 3, 15)));
    }

    #[test]
    fn short_rows_are_sparse_not_invalid() {
        let (docs, _) = documents();
        let sparse = &docs[1];
        assert!(sparse.is_valid());
        assert_eq!(sparse.identifier.len(), 36);
        assert!(sparse.distributions.is_empty());
        assert_eq!(sparse.bounding_box, None);
        assert_eq!(sparse.plan_type, PlanType::FlaechennutzPlan);
        assert_eq!(sparse.extras.metadata.modified, harvest_time());
    }

    #[test]
    fn serial_dates_count_from_the_1900_epoch() {
        let date = serial_date(44635.0).unwrap();
        assert_eq!((date.year(), date.month(), date.day()), (2022, 3, 15));
        assert_eq!(serial_date(0.0), None);
    }

    #[test]
    fn missing_header_is_an_error() {
        let settings = settings(MapperKind::ExcelSparse);
        let mut factory = IndexDocumentFactory::default();
        let mut summary = Summary::new("excel");
        let err = map_rows(r#"{"header": [], "rows": [["x"]]}"#, &settings, &mut factory, harvest_time(), &mut summary)
            .unwrap_err();
        assert!(matches!(err, MapperError::MissingHeader));
    }
}
