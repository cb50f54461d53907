//! Comparator-aware patient demographics extraction from free text.
//!
//! Age phrases are recognised in DE/FR/IT/EN with symbolic (`<= 12`) and
//! word-based (`unter 12`, `moins de 12`) comparators; a small lexicon infers
//! age bounds for newborn/child mentions when nothing explicit is present.
//! Gender comes from a multilingual token list. Explicit structured inputs
//! always win over text extraction (the engine reconciles).

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Where an extracted value came from, for the UI to display provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DemographicSource {
    Text,
    Inferred,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatientDemographics {
    pub age_value: Option<i64>,
    pub age_operator: Option<String>,
    pub age_source: Option<DemographicSource>,
    pub gender: Option<String>,
    pub gender_source: Option<DemographicSource>,
}

const FEMALE_TOKENS: &[&str] = &[
    "weiblich", "frau", "patientin", "maedchen", "madchen", "fille", "feminin", "femminile",
    "femmina", "ragazza", "donna", "female", "girl",
];

const MALE_TOKENS: &[&str] = &[
    "maennlich", "mannlich", "mann", "patient", "junge", "knabe", "garcon", "masculin",
    "maschio", "homme", "uomo", "male", "boy", "ragazzo",
];

const NEWBORN_TOKENS: &[&str] = &[
    "baby", "saeugling", "saeuglinge", "neugeboren", "neonato", "nouveau", "nouveau-ne",
    "newborn",
];

const CHILD_TOKENS: &[&str] = &[
    "kind", "kinder", "kindern", "kindes", "knabe", "knaben", "maedchen", "madchen", "enfant",
    "enfants", "bambino", "bambini", "pediatrie", "pediatrisch", "pediatrico", "pediatrica",
];

fn symbol_age_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(<=|>=|<|>|=)\s*(\d{1,3})").unwrap())
}

fn word_age_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"\b(?:unter|weniger als|moins de|meno di|piu piccolo di)\s*(\d{1,3})")
                    .unwrap(),
                "<",
            ),
            (
                Regex::new(
                    r"\b(?:bis zu|bis|maximal|hoechstens|jusqua|jusqu a|fino a|al massimo|au plus|au maximum)\s*(\d{1,3})",
                )
                .unwrap(),
                "<=",
            ),
            (
                Regex::new(r"\b(?:ab|mindestens|minimal|au moins|a partir de|da|minimo)\s*(\d{1,3})")
                    .unwrap(),
                ">=",
            ),
            (
                Regex::new(r"\b(?:ueber|uber|mehr als|plus de|superieur a|piu di|maggiore di)\s*(\d{1,3})")
                    .unwrap(),
                ">",
            ),
        ]
    })
}

fn direct_age_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(\d{1,3})\s*(?:jahre alt|jahre|jahr|jahrigen|jahrige|jahrig|jaehrigen|jaehrige|jaehrig|anni|anno|ans|an|years? old|years?|yo)\b",
        )
        .unwrap()
    })
}

/// Folds accented characters to their ASCII base so the multilingual token
/// lists stay small (`jährig` → `jahrig`, `âgé` → `age`).
fn strip_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'ä' | 'à' | 'â' | 'á' => 'a',
            'ö' | 'ô' | 'ò' | 'ó' => 'o',
            'ü' | 'ù' | 'û' | 'ú' => 'u',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ì' | 'í' | 'ï' => 'i',
            'ç' => 'c',
            'Ä' | 'À' | 'Â' | 'Á' => 'A',
            'Ö' | 'Ô' | 'Ò' | 'Ó' => 'O',
            'Ü' | 'Ù' | 'Û' | 'Ú' => 'U',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            _ => c,
        })
        .collect()
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

/// Extracts age and gender hints from free text.
pub fn extract_patient_demographics(text: &str) -> PatientDemographics {
    let mut result = PatientDemographics::default();
    if text.trim().is_empty() {
        return result;
    }

    let normalized = strip_accents(text).replace(['-', '/'], " ");
    let cleaned = normalized
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    // Priority: symbolic comparator > word comparator > direct "N jährig".
    let mut best: Option<(u8, i64, Option<&str>)> = None;
    let mut consider = |value: i64, operator: Option<&'static str>, priority: u8| {
        if !(0..=130).contains(&value) {
            return;
        }
        if best.map_or(true, |(p, _, _)| priority > p) {
            best = Some((priority, value, operator));
        }
    };

    for caps in symbol_age_regex().captures_iter(&cleaned) {
        if let Ok(value) = caps[2].parse() {
            let operator = match &caps[1] {
                "<" => "<",
                "<=" => "<=",
                ">" => ">",
                ">=" => ">=",
                _ => "=",
            };
            consider(value, Some(operator), 3);
        }
    }
    for (pattern, operator) in word_age_patterns() {
        for caps in pattern.captures_iter(&cleaned) {
            if let Ok(value) = caps[1].parse() {
                consider(value, Some(*operator), 2);
            }
        }
    }
    for caps in direct_age_regex().captures_iter(&cleaned) {
        if let Ok(value) = caps[1].parse() {
            consider(value, Some("="), 1);
        }
    }

    if let Some((_, value, operator)) = best {
        result.age_value = Some(value);
        result.age_operator = Some(operator.unwrap_or("=").to_string());
        result.age_source = Some(DemographicSource::Text);
    } else if NEWBORN_TOKENS.iter().any(|t| contains_word(&cleaned, t)) {
        result.age_value = Some(1);
        result.age_operator = Some("<=".into());
        result.age_source = Some(DemographicSource::Inferred);
    } else if CHILD_TOKENS.iter().any(|t| contains_word(&cleaned, t)) {
        result.age_value = Some(12);
        result.age_operator = Some("<=".into());
        result.age_source = Some(DemographicSource::Inferred);
    }

    if FEMALE_TOKENS.iter().any(|t| contains_word(&cleaned, t)) {
        result.gender = Some("weiblich".into());
        result.gender_source = Some(DemographicSource::Text);
    } else if MALE_TOKENS.iter().any(|t| contains_word(&cleaned, t)) {
        result.gender = Some("männlich".into());
        result.gender_source = Some(DemographicSource::Text);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_age_with_equal_operator() {
        let result = extract_patient_demographics("Kind 8 jährig mit Fieber");
        assert_eq!(result.age_value, Some(8));
        assert_eq!(result.age_operator.as_deref(), Some("="));
        assert_eq!(result.age_source, Some(DemographicSource::Text));
    }

    #[test]
    fn word_comparators_beat_direct_mentions() {
        let result = extract_patient_demographics("Patientin unter 16 Jahren, 40 jährige Mutter");
        assert_eq!(result.age_value, Some(16));
        assert_eq!(result.age_operator.as_deref(), Some("<"));
    }

    #[test]
    fn symbolic_comparators_have_highest_priority() {
        let result = extract_patient_demographics("Alter >= 65, ungefähr 70 Jahre");
        assert_eq!(result.age_value, Some(65));
        assert_eq!(result.age_operator.as_deref(), Some(">="));
    }

    #[test]
    fn french_age_and_gender() {
        let result = extract_patient_demographics("fille de moins de 12 ans");
        assert_eq!(result.age_value, Some(12));
        assert_eq!(result.age_operator.as_deref(), Some("<"));
        assert_eq!(result.gender.as_deref(), Some("weiblich"));
    }

    #[test]
    fn child_token_infers_age_bound() {
        let result = extract_patient_demographics("Konsultation mit Kind");
        assert_eq!(result.age_value, Some(12));
        assert_eq!(result.age_operator.as_deref(), Some("<="));
        assert_eq!(result.age_source, Some(DemographicSource::Inferred));
    }

    #[test]
    fn newborn_beats_child_inference() {
        let result = extract_patient_demographics("Baby, Kind der Familie");
        assert_eq!(result.age_value, Some(1));
    }

    #[test]
    fn gender_from_italian_tokens() {
        let result = extract_patient_demographics("uomo di 54 anni");
        assert_eq!(result.gender.as_deref(), Some("männlich"));
        assert_eq!(result.age_value, Some(54));
    }

    #[test]
    fn implausible_ages_are_ignored() {
        let result = extract_patient_demographics("Raum 250 jahre alt");
        assert_eq!(result.age_value, None);
    }

    #[test]
    fn empty_text_yields_nothing() {
        let result = extract_patient_demographics("  ");
        assert!(result.age_value.is_none());
        assert!(result.gender.is_none());
    }
}
