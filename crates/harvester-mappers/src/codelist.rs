//! Static translation tables from source-specific codes to the PLU enums.

use std::collections::HashMap;

use harvester_core::{DocType, PlanState, PlanType, ProcedureState, ProcedureType};
use once_cell::sync::Lazy;

/// XPlanung `planArt` codes per feature type: `(PlanType, planTypeFine)`.
pub static XPLAN_PLAN_TYPES: Lazy<HashMap<&'static str, HashMap<&'static str, (PlanType, &'static str)>>> =
    Lazy::new(|| {
        let mut table = HashMap::new();
        table.insert(
            "BP_Plan",
            HashMap::from([
                ("1000", (PlanType::BebauPlan, "BPlan")),
                ("10000", (PlanType::BebauPlan, "EinfacherBPlan")),
                ("10001", (PlanType::BebauPlan, "QualifizierterBPlan")),
                ("3000", (PlanType::BebauPlan, "VorhabenbezogenerBPlan")),
                ("3100", (PlanType::BebauPlan, "VorhabenUndErschliessungsplan")),
                ("4000", (PlanType::SonstPlan, "InnenbereichsSatzung")),
                ("40000", (PlanType::SonstPlan, "KlarstellungsSatzung")),
                ("40001", (PlanType::SonstPlan, "EntwicklungsSatzung")),
                ("40002", (PlanType::SonstPlan, "ErgaenzungsSatzung")),
                ("5000", (PlanType::SonstPlan, "AussenbereichsSatzung")),
                ("7000", (PlanType::SonstPlan, "OertlicheBauvorschrift")),
                ("9999", (PlanType::SonstPlan, "Sonstiges")),
            ]),
        );
        table.insert(
            "FP_Plan",
            HashMap::from([
                ("1000", (PlanType::FlaechennutzPlan, "FPlan")),
                ("2000", (PlanType::FlaechennutzPlan, "GemeinsamesFPlan")),
                ("3000", (PlanType::FlaechennutzPlan, "RegFPlan")),
                ("4000", (PlanType::FlaechennutzPlan, "FPlanRegPlan")),
                ("5000", (PlanType::FlaechennutzPlan, "SachlicherTeilplan")),
                ("9999", (PlanType::SonstPlan, "Sonstiges")),
            ]),
        );
        table.insert(
            "RP_Plan",
            HashMap::from([
                ("1000", (PlanType::RaumordPlan, "Regionalplan")),
                ("2000", (PlanType::RaumordPlan, "SachlicherTeilplanRegionalebene")),
                ("2001", (PlanType::RaumordPlan, "SachlicherTeilplanLandesebene")),
                ("3000", (PlanType::RaumordPlan, "Braunkohlenplan")),
                ("4000", (PlanType::RaumordPlan, "LandesweiterRaumordnungsplan")),
                ("5000", (PlanType::RaumordPlan, "StandortkonzeptBund")),
                ("6000", (PlanType::RaumordPlan, "AWZPlan")),
                ("7000", (PlanType::RaumordPlan, "RaeumlicherTeilplan")),
                ("9999", (PlanType::SonstPlan, "Sonstiges")),
            ]),
        );
        table.insert(
            "LP_Plan",
            HashMap::from([
                ("1000", (PlanType::LandschaftsPlan, "Landschaftsprogramm")),
                ("2000", (PlanType::LandschaftsPlan, "Landschaftsrahmenplan")),
                ("3000", (PlanType::LandschaftsPlan, "Landschaftsplan")),
                ("4000", (PlanType::LandschaftsPlan, "Gruenordnungsplan")),
                ("9999", (PlanType::SonstPlan, "Sonstiges")),
            ]),
        );
        table.insert(
            "SO_Plan",
            HashMap::from([
                ("01", (PlanType::SonstPlan, "Sonstiges")),
                ("9999", (PlanType::SonstPlan, "Sonstiges")),
            ]),
        );
        table
    });

/// XPlanung `rechtsstand` codes shared by the plan feature types.
pub static XPLAN_PLAN_STATES: Lazy<HashMap<&'static str, PlanState>> = Lazy::new(|| {
    HashMap::from([
        ("1000", PlanState::InAufstellung),
        ("2000", PlanState::InAufstellung),
        ("2100", PlanState::InAufstellung),
        ("2200", PlanState::InAufstellung),
        ("2300", PlanState::InAufstellung),
        ("2400", PlanState::InAufstellung),
        ("3000", PlanState::Festgesetzt),
        ("4000", PlanState::Festgesetzt),
        ("4500", PlanState::Festgesetzt),
        ("5000", PlanState::Archiviert),
        ("50000", PlanState::Archiviert),
        ("50001", PlanState::Archiviert),
    ])
});

/// XPlanung `BP_Verfahren` codes.
pub static XPLAN_PROCEDURE_TYPES: Lazy<HashMap<&'static str, ProcedureType>> = Lazy::new(|| {
    HashMap::from([
        ("1000", ProcedureType::NormVerfahren),
        ("2000", ProcedureType::VereinfachtVerfahren),
        ("3000", ProcedureType::BeschleunigtVerfahren),
        ("4000", ProcedureType::Parag13b),
    ])
});

/// XPlanung `XP_ExterneReferenzTyp` codes.
pub static XPLAN_DOC_TYPES: Lazy<HashMap<&'static str, DocType>> = Lazy::new(|| {
    HashMap::from([
        ("1010", DocType::Planzeichnung),
        ("1020", DocType::Textteil),
        ("1030", DocType::Planzeichnung),
        ("1040", DocType::Begruendung),
        ("1080", DocType::Umweltbericht),
        ("1090", DocType::Textteil),
        ("1100", DocType::Planzeichnung),
        ("2100", DocType::Begruendung),
    ])
});

/// FIS-Broker (Berlin) `festsg` flag.
pub static FIS_PLAN_STATES: Lazy<HashMap<&'static str, PlanState>> = Lazy::new(|| {
    HashMap::from([
        ("ja", PlanState::Festgesetzt),
        ("nein", PlanState::InAufstellung),
    ])
});

/// FIS-Broker `planart` values: `(PlanType, planTypeFine)`.
pub static FIS_PLAN_TYPES: Lazy<HashMap<&'static str, (PlanType, &'static str)>> = Lazy::new(|| {
    HashMap::from([
        ("bebauungsplan", (PlanType::BebauPlan, "BPlan")),
        ("vorhabenbezogener bebauungsplan", (PlanType::BebauPlan, "VorhabenbezogenerBPlan")),
        ("einfacher bebauungsplan", (PlanType::BebauPlan, "EinfacherBPlan")),
        ("landschaftsplan", (PlanType::LandschaftsPlan, "Landschaftsplan")),
    ])
});

/// Keyword fragments that identify a plan type in catalogue records.
static KEYWORD_PLAN_TYPES: &[(&str, PlanType)] = &[
    ("bebauungsplan", PlanType::BebauPlan),
    ("flächennutzungsplan", PlanType::FlaechennutzPlan),
    ("flaechennutzungsplan", PlanType::FlaechennutzPlan),
    ("regionalplan", PlanType::RaumordPlan),
    ("raumordnungsplan", PlanType::RaumordPlan),
    ("landschaftsplan", PlanType::LandschaftsPlan),
];

pub fn xplan_plan_type(typename: &str, code: Option<&str>) -> (PlanType, Option<String>) {
    code.and_then(|code| XPLAN_PLAN_TYPES.get(typename)?.get(code.trim()))
        .map(|(plan_type, fine)| (*plan_type, Some(fine.to_string())))
        .unwrap_or((PlanType::Unknown, None))
}

pub fn xplan_plan_state(code: Option<&str>) -> PlanState {
    code.and_then(|c| XPLAN_PLAN_STATES.get(c.trim()).copied())
        .unwrap_or_default()
}

pub fn xplan_procedure_type(code: Option<&str>) -> ProcedureType {
    code.and_then(|c| XPLAN_PROCEDURE_TYPES.get(c.trim()).copied())
        .unwrap_or_default()
}

pub fn xplan_doc_type(code: Option<&str>) -> DocType {
    code.and_then(|c| XPLAN_DOC_TYPES.get(c.trim()).copied())
        .unwrap_or(DocType::SonstigesDokument)
}

pub fn fis_plan_state(value: Option<&str>) -> PlanState {
    value
        .and_then(|v| FIS_PLAN_STATES.get(v.trim().to_lowercase().as_str()).copied())
        .unwrap_or_default()
}

pub fn fis_plan_type(value: Option<&str>) -> (PlanType, Option<String>) {
    value
        .and_then(|v| FIS_PLAN_TYPES.get(v.trim().to_lowercase().as_str()))
        .map(|(plan_type, fine)| (*plan_type, Some(fine.to_string())))
        .unwrap_or((PlanType::Unknown, None))
}

pub fn plan_type_from_keywords<'a>(keywords: impl IntoIterator<Item = &'a str>) -> PlanType {
    for keyword in keywords {
        let lower = keyword.to_lowercase();
        if let Some((_, plan_type)) = KEYWORD_PLAN_TYPES.iter().find(|(frag, _)| lower.contains(frag)) {
            return *plan_type;
        }
    }
    PlanType::Unknown
}

/// Procedure state implied by a plan's legal state.
pub fn procedure_state_for(state: PlanState) -> ProcedureState {
    match state {
        PlanState::InAufstellung => ProcedureState::Laufend,
        PlanState::Festgesetzt | PlanState::Archiviert => ProcedureState::Abgeschlossen,
        PlanState::Unknown => ProcedureState::Unknown,
    }
}
