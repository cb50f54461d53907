//! Billing response assembly.
//!
//! Defines the `abrechnung` response contract (package, TARDOC or error)
//! and the TARDOC assembler: rule-passing items of type E/EZ become the
//! individual-service bill when no package applies.

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::types::{Language, TableEntry};
use crate::catalog::CatalogStore;
use crate::i18n::translate;
use crate::pauschale::EvaluatedCandidate;

/// Per-item rule check record as returned to the caller
/// (`regel_ergebnisse_details`).
#[derive(Debug, Clone, Serialize)]
pub struct RuleResultDetail {
    pub lkn: Option<String>,
    pub initiale_menge: u32,
    pub regelpruefung: RuleCheckSummary,
    pub finale_menge: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub quantity_reduced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleCheckSummary {
    pub abrechnungsfaehig: bool,
    pub fehler: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TardocLine {
    pub lkn: String,
    pub menge: u32,
    pub typ: String,
    pub beschreibung: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PauschaleDetails {
    #[serde(rename = "Pauschale")]
    pub code: String,
    #[serde(rename = "Pauschale_Text")]
    pub text: String,
    #[serde(rename = "Taxpunkte")]
    pub tax_points: Option<serde_json::Value>,
    pub pauschale_erklaerung_html: String,
    pub potential_icds: Vec<TableEntry>,
}

/// The billing decision in its wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Abrechnung {
    #[serde(rename = "Pauschale")]
    Pauschale {
        details: PauschaleDetails,
        bedingungs_pruef_html: String,
        bedingungs_fehler: Vec<String>,
        conditions_met: bool,
    },
    #[serde(rename = "TARDOC")]
    Tardoc { leistungen: Vec<TardocLine> },
    #[serde(rename = "Error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        evaluated_pauschalen: Option<Vec<EvaluatedCandidate>>,
    },
}

impl Abrechnung {
    pub fn type_name(&self) -> &'static str {
        match self {
            Abrechnung::Pauschale { .. } => "Pauschale",
            Abrechnung::Tardoc { .. } => "TARDOC",
            Abrechnung::Error { .. } => "Error",
        }
    }
}

/// Filters the rule results down to billable E/EZ positions. An empty
/// result is the terminal error case, not an exception.
pub fn prepare_tardoc_billing(
    rule_results: &[RuleResultDetail],
    store: &CatalogStore,
    lang: Language,
) -> Abrechnung {
    let mut lines: Vec<TardocLine> = Vec::new();
    for result in rule_results {
        let Some(lkn) = result.lkn.as_deref() else {
            continue;
        };
        if !result.regelpruefung.abrechnungsfaehig || result.finale_menge == 0 {
            continue;
        }
        let Some(entry) = store.code_details(lkn) else {
            warn!(%lkn, "rule-passing code missing from the catalogue, skipped");
            continue;
        };
        if !entry.typ.is_individual() {
            continue;
        }
        lines.push(TardocLine {
            lkn: lkn.to_string(),
            menge: result.finale_menge,
            typ: entry.typ.as_str().to_string(),
            beschreibung: entry.description_in(lang).unwrap_or_default().to_string(),
        });
    }

    if lines.is_empty() {
        Abrechnung::Error {
            message: translate("no_billable_services", lang).to_string(),
            evaluated_pauschalen: None,
        }
    } else {
        info!(positions = lines.len(), "TARDOC billing prepared");
        Abrechnung::Tardoc { leistungen: lines }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CatalogStore {
        let entries: Vec<crate::catalog::CatalogEntry> = vec![
            serde_json::from_value(serde_json::json!({
                "LKN": "CA.00.0010", "Typ": "E", "Beschreibung": "Konsultation Basis"
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "LKN": "C03.GC.0200", "Typ": "P", "Beschreibung": "Bronchoskopie"
            }))
            .unwrap(),
        ];
        CatalogStore::new(
            entries,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            "test".into(),
        )
    }

    fn detail(lkn: &str, billable: bool, menge: u32) -> RuleResultDetail {
        RuleResultDetail {
            lkn: Some(lkn.to_string()),
            initiale_menge: menge,
            regelpruefung: RuleCheckSummary {
                abrechnungsfaehig: billable,
                fehler: Vec::new(),
            },
            finale_menge: menge,
            quantity_reduced: false,
        }
    }

    #[test]
    fn only_billable_individual_items_survive() {
        let results = vec![
            detail("CA.00.0010", true, 1),
            detail("C03.GC.0200", true, 1), // P type, not TARDOC
            detail("CA.00.0010", false, 1), // not billable
        ];
        let billing = prepare_tardoc_billing(&results, &store(), Language::De);
        match billing {
            Abrechnung::Tardoc { leistungen } => {
                assert_eq!(leistungen.len(), 1);
                assert_eq!(leistungen[0].lkn, "CA.00.0010");
                assert_eq!(leistungen[0].typ, "E");
            }
            other => panic!("unexpected billing {other:?}"),
        }
    }

    #[test]
    fn zero_quantity_items_are_dropped() {
        let mut zero = detail("CA.00.0010", true, 1);
        zero.finale_menge = 0;
        let billing = prepare_tardoc_billing(&[zero], &store(), Language::De);
        assert!(matches!(billing, Abrechnung::Error { .. }));
    }

    #[test]
    fn empty_result_is_the_no_billable_error() {
        let billing = prepare_tardoc_billing(&[], &store(), Language::Fr);
        match billing {
            Abrechnung::Error { message, .. } => {
                assert!(message.contains("Aucune prestation"));
            }
            other => panic!("unexpected billing {other:?}"),
        }
    }

    #[test]
    fn serialisation_uses_wire_tags() {
        let billing = prepare_tardoc_billing(&[detail("CA.00.0010", true, 2)], &store(), Language::De);
        let value = serde_json::to_value(&billing).unwrap();
        assert_eq!(value["type"], "TARDOC");
        assert_eq!(value["leistungen"][0]["menge"], 2);
    }
}
