//! Codelist-backed planning (PLU) enumerations.
//!
//! Every enum carries an `Unknown` sentinel serialized as `unbekannt`; mappers
//! fall back to it for unmapped codes and never leave the field empty.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const UNKNOWN: &str = "unbekannt";

fn last_segment(code: &str) -> &str {
    let trimmed = code.trim().trim_end_matches('/');
    trimmed
        .rsplit(|c: char| c == '/' || c == '#')
        .next()
        .unwrap_or(trimmed)
}

macro_rules! codelist {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(from = "String")]
        pub enum $name {
            $(#[serde(rename = $value)] $variant,)+
            #[default]
            #[serde(rename = "unbekannt")]
            Unknown,
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+ $name::Unknown];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value,)+
                    $name::Unknown => UNKNOWN,
                }
            }

            /// Accepts the canonical value or a codelist URI ending in it, in any casing.
            pub fn from_code(code: &str) -> Self {
                let key = last_segment(code);
                $(if key.eq_ignore_ascii_case($value) {
                    return $name::$variant;
                })+
                $name::Unknown
            }

            pub fn is_unknown(&self) -> bool {
                matches!(self, $name::Unknown)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name::from_code(&value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

codelist!(
    /// Legal state of a plan.
    PlanState {
        Festgesetzt => "festgesetzt",
        InAufstellung => "inAufstellung",
        Archiviert => "archiviert",
    }
);

codelist!(
    PlanType {
        BebauPlan => "bebauPlan",
        FlaechennutzPlan => "flaechennutzPlan",
        RaumordPlan => "raumordPlan",
        LandschaftsPlan => "landschaftsPlan",
        SonstPlan => "sonstPlan",
    }
);

codelist!(
    ProcedureState {
        Geplant => "geplant",
        Laufend => "laufend",
        Abgeschlossen => "abgeschlossen",
    }
);

codelist!(
    ProcedureType {
        NormVerfahren => "normVerfahren",
        VereinfachtVerfahren => "vereinfachtVerfahren",
        BeschleunigtVerfahren => "beschleunigtVerfahren",
        Parag13b => "parag13b",
        SonstVerf => "sonstVerf",
    }
);

codelist!(
    /// Participation step within a planning procedure.
    ProcessStepType {
        FruehzeitigeOeffentlichkeitsBeteiligung => "fruehzeitigeOeffentlichkeitsBeteiligung",
        FruehzeitigeBehoerdenBeteiligung => "fruehzeitigeBehoerdenBeteiligung",
        OeffentlicheAuslegung => "oeffentlicheAuslegung",
        BeteiligungBehoerden => "beteiligungBehoerden",
        Sonstiges => "sonstiges",
    }
);

codelist!(
    DocType {
        Begruendung => "begruendung",
        Planzeichnung => "planzeichnung",
        Textteil => "textteil",
        Umweltbericht => "umweltbericht",
        SonstigesDokument => "sonstiges",
    }
);
