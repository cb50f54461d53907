//! Storage-side row types for the tariff catalogues.
//!
//! These mirror the JSON files shipped with the official tariff release
//! (German field names). Evaluation-side types are derived from them once at
//! startup; the raw rows are kept separate so the storage format never leaks
//! into the rule and condition engines.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Response language for catalogue texts and user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    De,
    Fr,
    It,
}

impl Language {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "fr" => Language::Fr,
            "it" => Language::It,
            _ => Language::De,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::De => "de",
            Language::Fr => "fr",
            Language::It => "it",
        }
    }
}

/// Picks the language variant of a multilingual field, falling back to German.
pub fn lang_field<'a>(
    de: Option<&'a str>,
    fr: Option<&'a str>,
    it: Option<&'a str>,
    lang: Language,
) -> Option<&'a str> {
    let preferred = match lang {
        Language::De => de,
        Language::Fr => fr,
        Language::It => it,
    };
    preferred.filter(|v| !v.is_empty()).or(de)
}

/// Billing type of a service code. E/EZ are individually billable (TARDOC),
/// P/PZ are flat-rate package components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServiceType {
    E,
    Ez,
    P,
    Pz,
    Other(String),
}

impl ServiceType {
    pub fn is_individual(&self) -> bool {
        matches!(self, ServiceType::E | ServiceType::Ez)
    }

    pub fn is_package_component(&self) -> bool {
        matches!(self, ServiceType::P | ServiceType::Pz)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ServiceType::E => "E",
            ServiceType::Ez => "EZ",
            ServiceType::P => "P",
            ServiceType::Pz => "PZ",
            ServiceType::Other(s) => s,
        }
    }
}

impl From<String> for ServiceType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "E" => ServiceType::E,
            "EZ" => ServiceType::Ez,
            "P" => ServiceType::P,
            "PZ" => ServiceType::Pz,
            other => ServiceType::Other(other.to_string()),
        }
    }
}

impl From<ServiceType> for String {
    fn from(value: ServiceType) -> Self {
        value.as_str().to_string()
    }
}

/// One Leistungskatalog entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "LKN")]
    pub lkn: String,
    #[serde(rename = "Typ")]
    pub typ: ServiceType,
    #[serde(rename = "Beschreibung")]
    pub description: Option<String>,
    #[serde(rename = "Beschreibung_f")]
    pub description_fr: Option<String>,
    #[serde(rename = "Beschreibung_i")]
    pub description_it: Option<String>,
    #[serde(rename = "MedizinischeInterpretation")]
    pub interpretation: Option<String>,
    #[serde(rename = "MedizinischeInterpretation_f")]
    pub interpretation_fr: Option<String>,
    #[serde(rename = "MedizinischeInterpretation_i")]
    pub interpretation_it: Option<String>,
}

impl CatalogEntry {
    pub fn description_in(&self, lang: Language) -> Option<&str> {
        lang_field(
            self.description.as_deref(),
            self.description_fr.as_deref(),
            self.description_it.as_deref(),
            lang,
        )
    }

    pub fn interpretation_in(&self, lang: Language) -> Option<&str> {
        lang_field(
            self.interpretation.as_deref(),
            self.interpretation_fr.as_deref(),
            self.interpretation_it.as_deref(),
            lang,
        )
    }
}

/// One row of the Tarif-Tables file. A logical table is the set of rows
/// sharing a `Tabelle` name (case-insensitive).
#[derive(Debug, Clone, Deserialize)]
pub struct TableRow {
    #[serde(rename = "Tabelle")]
    pub table: String,
    #[serde(rename = "Tabelle_Typ")]
    pub table_type: Option<String>,
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Code_Text")]
    pub text: Option<String>,
    #[serde(rename = "Code_Text_f")]
    pub text_fr: Option<String>,
    #[serde(rename = "Code_Text_i")]
    pub text_it: Option<String>,
}

impl TableRow {
    pub fn text_in(&self, lang: Language) -> Option<&str> {
        lang_field(
            self.text.as_deref(),
            self.text_fr.as_deref(),
            self.text_it.as_deref(),
            lang,
        )
    }
}

/// Language-resolved table entry handed to the evaluators and the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Code_Text")]
    pub text: String,
}

/// One flat-rate package definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PauschaleDef {
    #[serde(rename = "Pauschale")]
    pub code: String,
    #[serde(rename = "Pauschale_Text")]
    pub text: Option<String>,
    #[serde(rename = "Pauschale_Text_f")]
    pub text_fr: Option<String>,
    #[serde(rename = "Pauschale_Text_i")]
    pub text_it: Option<String>,
    #[serde(rename = "Taxpunkte")]
    pub tax_points: Option<serde_json::Value>,
}

impl PauschaleDef {
    pub fn text_in(&self, lang: Language) -> Option<&str> {
        lang_field(
            self.text.as_deref(),
            self.text_fr.as_deref(),
            self.text_it.as_deref(),
            lang,
        )
    }
}

/// One raw package condition row. The parser in `pauschale::conditions`
/// turns these into typed atoms; nothing else should interpret them.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionRow {
    #[serde(rename = "Pauschale")]
    pub pauschale: String,
    #[serde(rename = "BedingungsID", default)]
    pub id: Option<i64>,
    #[serde(rename = "Bedingungstyp", default)]
    pub condition_type: String,
    #[serde(rename = "Werte", default, deserialize_with = "opt_stringly")]
    pub values: Option<String>,
    #[serde(rename = "Feld", default)]
    pub field: Option<String>,
    #[serde(rename = "Wert", default, deserialize_with = "opt_stringly")]
    pub value: Option<String>,
    #[serde(rename = "MinWert", default)]
    pub min_value: Option<i64>,
    #[serde(rename = "MaxWert", default)]
    pub max_value: Option<i64>,
    #[serde(rename = "Vergleichsoperator", default)]
    pub comparator: Option<String>,
    #[serde(rename = "Gruppe", default)]
    pub group: Option<i64>,
    #[serde(rename = "Operator", default)]
    pub operator: Option<String>,
}

/// Package–service link row: the service code participates in the package.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceLinkRow {
    #[serde(rename = "Leistungsposition")]
    pub lkn: String,
    #[serde(rename = "Pauschale")]
    pub pauschale: String,
}

/// One rule book entry: a service code with its ordered rule rows.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleBookEntry {
    #[serde(rename = "LKN")]
    pub lkn: String,
    #[serde(rename = "Regeln", default)]
    pub rules: Vec<RuleRow>,
}

/// Raw rule row as stored in the rule book JSON. Field names vary between
/// tariff releases (`LKN` vs `LKNs`, `ICD` vs `ICDs`), so both spellings are
/// accepted and merged by the parser in `rules`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleRow {
    #[serde(rename = "Typ", default)]
    pub typ: String,
    #[serde(rename = "MaxMenge", default)]
    pub max_quantity: Option<f64>,
    #[serde(rename = "LKNs", default, deserialize_with = "string_or_list")]
    pub lkns: Vec<String>,
    #[serde(rename = "LKN", default, deserialize_with = "string_or_list")]
    pub lkn: Vec<String>,
    #[serde(rename = "Feld", default)]
    pub field: Option<String>,
    #[serde(rename = "Wert", default, deserialize_with = "value_or_list")]
    pub value: Vec<String>,
    #[serde(rename = "MinWert", default)]
    pub min_value: Option<i64>,
    #[serde(rename = "MaxWert", default)]
    pub max_value: Option<i64>,
    #[serde(rename = "ICD", default, deserialize_with = "string_or_list")]
    pub icd: Vec<String>,
    #[serde(rename = "ICDs", default, deserialize_with = "string_or_list")]
    pub icds: Vec<String>,
    #[serde(rename = "Pauschale", default, deserialize_with = "string_or_list")]
    pub pauschale: Vec<String>,
    #[serde(rename = "Pauschalen", default, deserialize_with = "string_or_list")]
    pub pauschalen: Vec<String>,
}

/// Leistungsgruppe membership row.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupRow {
    #[serde(rename = "Gruppe")]
    pub group: String,
    #[serde(rename = "LKN")]
    pub lkn: String,
}

/// Synonym catalogue entry: a base term with its accepted variants.
#[derive(Debug, Clone, Deserialize)]
pub struct SynonymEntry {
    #[serde(rename = "term")]
    pub term: String,
    #[serde(rename = "variants", default)]
    pub variants: Vec<String>,
}

/// One row of the pre-built embedding index (offline artefact).
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingRow {
    #[serde(rename = "lkn")]
    pub lkn: String,
    #[serde(rename = "vector")]
    pub vector: Vec<f32>,
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    collect_stringly(&value).map_err(de::Error::custom)
}

/// Like `string_or_list` but also accepts a bare number (used by `Wert`).
fn value_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    string_or_list(deserializer)
}

fn opt_stringly<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    })
}

fn collect_stringly(value: &serde_json::Value) -> Result<Vec<String>, String> {
    match value {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::String(s) if s.is_empty() => Ok(Vec::new()),
        serde_json::Value::String(s) => Ok(vec![s.clone()]),
        serde_json::Value::Number(n) => Ok(vec![n.to_string()]),
        serde_json::Value::Array(items) => Ok(items
            .iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        other => Err(format!("expected string or list, got {other}")),
    }
}
