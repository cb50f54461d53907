//! Request context shared by the rule engine and the package evaluators.

use serde::{Deserialize, Serialize};

use crate::catalog::normalize_code;
use crate::catalog::types::Language;

/// Canonical German laterality values used throughout the engine.
pub const LATERALITY_LEFT: &str = "links";
pub const LATERALITY_RIGHT: &str = "rechts";
pub const LATERALITY_BOTH: &str = "beidseits";
pub const LATERALITY_UNKNOWN: &str = "unbekannt";

/// Maps free-form laterality words (DE/FR/IT/EN) to the canonical value.
pub fn normalize_laterality(raw: &str) -> Option<String> {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    let canonical = match value.as_str() {
        "links" | "link" | "gauche" | "sinistra" | "sinistro" | "left" => LATERALITY_LEFT,
        "rechts" | "droite" | "droit" | "destra" | "destro" | "right" => LATERALITY_RIGHT,
        "beidseits" | "beidseitig" | "bilateral" | "bilatéral" | "bilaterale" | "beide"
        | "both" => LATERALITY_BOTH,
        "unbekannt" | "unknown" => LATERALITY_UNKNOWN,
        _ => return Some(value),
    };
    Some(canonical.to_string())
}

/// Maps free-form gender words to the canonical German value the rule data
/// uses (`weiblich` / `männlich` / `divers`).
pub fn normalize_gender(raw: &str) -> Option<String> {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    let canonical = match value.as_str() {
        "w" | "f" | "weiblich" | "frau" | "female" | "femme" | "feminin" | "féminin"
        | "femminile" | "donna" => "weiblich",
        "m" | "männlich" | "maennlich" | "mann" | "male" | "homme" | "masculin" | "maschile"
        | "uomo" => "männlich",
        "d" | "divers" | "diverse" | "autre" | "altro" => "divers",
        _ => return Some(value),
    };
    Some(canonical.to_string())
}

/// Everything known about the encounter when rules and package conditions
/// are evaluated. All codes are canonical upper-case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingContext {
    pub lkn_codes: Vec<String>,
    pub icd_codes: Vec<String>,
    pub medications: Vec<String>,
    pub age: Option<i64>,
    pub gender: Option<String>,
    pub laterality: Option<String>,
    pub procedure_count: Option<i64>,
    pub use_icd: bool,
    pub lang: Language,
}

impl BillingContext {
    pub fn normalized(mut self) -> Self {
        self.lkn_codes = self.lkn_codes.iter().map(|c| normalize_code(c)).collect();
        self.icd_codes = self.icd_codes.iter().map(|c| normalize_code(c)).collect();
        self.medications = self.medications.iter().map(|c| normalize_code(c)).collect();
        self.gender = self.gender.as_deref().and_then(normalize_gender);
        self.laterality = self.laterality.as_deref().and_then(normalize_laterality);
        self
    }

    pub fn contains_lkn(&self, code: &str) -> bool {
        let code = normalize_code(code);
        self.lkn_codes.iter().any(|c| *c == code)
    }

    /// Procedure count with the bilateral convention applied: an explicitly
    /// bilateral encounter counts as two procedures when no count was given.
    pub fn effective_procedure_count(&self) -> Option<i64> {
        self.procedure_count.or_else(|| {
            (self.laterality.as_deref() == Some(LATERALITY_BOTH)).then_some(2)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laterality_normalises_across_languages() {
        assert_eq!(normalize_laterality("Bilatéral").as_deref(), Some("beidseits"));
        assert_eq!(normalize_laterality("LINKS").as_deref(), Some("links"));
        assert_eq!(normalize_laterality(" "), None);
    }

    #[test]
    fn gender_normalises_to_german_canonical() {
        assert_eq!(normalize_gender("W").as_deref(), Some("weiblich"));
        assert_eq!(normalize_gender("male").as_deref(), Some("männlich"));
        assert_eq!(normalize_gender("divers").as_deref(), Some("divers"));
    }

    #[test]
    fn bilateral_implies_procedure_count_two() {
        let ctx = BillingContext {
            laterality: Some("bilateral".into()),
            ..Default::default()
        }
        .normalized();
        assert_eq!(ctx.effective_procedure_count(), Some(2));

        let ctx = BillingContext {
            laterality: Some("bilateral".into()),
            procedure_count: Some(3),
            ..Default::default()
        }
        .normalized();
        assert_eq!(ctx.effective_procedure_count(), Some(3));
    }
}
