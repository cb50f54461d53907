//! Stage-1 post-processing: JSON extraction, schema validation and the
//! strict catalogue validation of everything the model claims.
//!
//! The model is untrusted: codes that do not exist verbatim in the
//! catalogue are dropped, and type/description are always overwritten from
//! the catalogue. Literal codes present in the raw text but missed by the
//! model are merged back in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::types::Language;
use crate::catalog::{normalize_code, CatalogStore};
use crate::error::{Result, TarifError};
use crate::retrieval::extract_lkn_codes;

const STAGE: &str = "stage1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifiedService {
    pub lkn: String,
    pub typ: String,
    pub beschreibung: String,
    pub menge: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedInfo {
    pub dauer_minuten: Option<i64>,
    pub menge_allgemein: Option<i64>,
    pub alter: Option<i64>,
    pub geschlecht: Option<String>,
    #[serde(default)]
    pub seitigkeit: Option<String>,
    #[serde(default)]
    pub anzahl_prozeduren: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage1Output {
    pub identified_leistungen: Vec<IdentifiedService>,
    pub extracted_info: ExtractedInfo,
    pub begruendung_llm: String,
}

/// Locates the JSON object in a raw model response: direct parse first,
/// then one Markdown-fence extraction pass, then the first/last balanced
/// braces. More than that is a parse failure.
fn extract_json_payload(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(fenced.trim()) {
            info!("stage-1 JSON extracted from Markdown fence");
            return Ok(value);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(TarifError::StageParse {
        stage: STAGE,
        message: format!(
            "response is not a JSON object (starts with: {})",
            trimmed.chars().take(80).collect::<String>()
        ),
    })
}

fn extract_fenced_block(raw: &str) -> Option<&str> {
    let fence_start = raw.find("```")?;
    let after = &raw[fence_start + 3..];
    let after = after
        .strip_prefix("json")
        .or_else(|| after.strip_prefix("JSON"))
        .unwrap_or(after);
    let fence_end = after.find("```")?;
    Some(&after[..fence_end])
}

fn parse_error(message: impl Into<String>) -> TarifError {
    TarifError::StageParse {
        stage: STAGE,
        message: message.into(),
    }
}

fn coerce_optional_int(value: Option<&Value>, field: &str) -> Result<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))),
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) if s.trim().is_empty() => Ok(None),
            Err(_) => Err(parse_error(format!("'{field}' is not a number: {s}"))),
        },
        Some(other) => Err(parse_error(format!("'{field}' has wrong type: {other}"))),
    }
}

fn optional_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(str::to_string)
}

/// Validates the Stage-1 response schema and coerces the loose spots the
/// models get wrong (string quantities, missing begruendung).
pub fn parse_stage1_response(raw: &str) -> Result<Stage1Output> {
    let payload = extract_json_payload(raw)?;
    let object = payload
        .as_object()
        .ok_or_else(|| parse_error("response is not a JSON object"))?;

    let services = object
        .get("identified_leistungen")
        .ok_or_else(|| parse_error("'identified_leistungen' missing"))?
        .as_array()
        .ok_or_else(|| parse_error("'identified_leistungen' is not a list"))?;

    let info = object
        .get("extracted_info")
        .ok_or_else(|| parse_error("'extracted_info' missing"))?
        .as_object()
        .ok_or_else(|| parse_error("'extracted_info' is not an object"))?;

    let mut identified = Vec::with_capacity(services.len());
    for (index, item) in services.iter().enumerate() {
        let item = item
            .as_object()
            .ok_or_else(|| parse_error(format!("service {index} is not an object")))?;
        let lkn = item
            .get("lkn")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| parse_error(format!("service {index} has no lkn")))?;
        let menge = match item.get("menge") {
            None | Some(Value::Null) => 1,
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| parse_error(format!("menge of service {index} is not integral")))?,
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| parse_error(format!("menge of service {index} is not a number")))?,
            Some(other) => {
                return Err(parse_error(format!(
                    "menge of service {index} has wrong type: {other}"
                )))
            }
        };
        if menge < 0 {
            return Err(parse_error(format!("menge of service {index} is negative")));
        }
        identified.push(IdentifiedService {
            lkn: lkn.to_string(),
            typ: optional_string(item.get("typ")).unwrap_or_default(),
            beschreibung: optional_string(item.get("beschreibung")).unwrap_or_default(),
            menge: menge as u32,
        });
    }

    let extracted_info = ExtractedInfo {
        dauer_minuten: coerce_optional_int(info.get("dauer_minuten"), "dauer_minuten")?,
        menge_allgemein: coerce_optional_int(info.get("menge_allgemein"), "menge_allgemein")?,
        alter: coerce_optional_int(info.get("alter"), "alter")?,
        geschlecht: optional_string(info.get("geschlecht")),
        seitigkeit: optional_string(info.get("seitigkeit")),
        anzahl_prozeduren: coerce_optional_int(info.get("anzahl_prozeduren"), "anzahl_prozeduren")?,
    };

    Ok(Stage1Output {
        identified_leistungen: identified,
        extracted_info,
        begruendung_llm: optional_string(object.get("begruendung_llm"))
            .unwrap_or_else(|| "N/A".to_string()),
    })
}

/// Drops codes the catalogue does not know, overwrites type and description
/// with catalogue truth, clamps quantities to ≥ 1 and merges literal codes
/// from the raw user text that the model missed.
pub fn validate_against_catalog(
    mut output: Stage1Output,
    user_text: &str,
    lang: Language,
    store: &CatalogStore,
) -> Stage1Output {
    let mut validated: Vec<IdentifiedService> = Vec::new();
    for mut service in output.identified_leistungen {
        let code = normalize_code(&service.lkn);
        let Some(entry) = store.code_details(&code) else {
            warn!(lkn = %service.lkn, "model suggested a code missing from the catalogue, dropped");
            continue;
        };
        service.lkn = code;
        service.typ = entry.typ.as_str().to_string();
        service.beschreibung = entry
            .description_in(lang)
            .unwrap_or_default()
            .to_string();
        service.menge = service.menge.max(1);
        validated.push(service);
    }

    for code in extract_lkn_codes(user_text) {
        if validated.iter().any(|s| s.lkn == code) {
            continue;
        }
        if let Some(entry) = store.code_details(&code) {
            info!(lkn = %code, "merging literal code from the input text");
            validated.push(IdentifiedService {
                lkn: code,
                typ: entry.typ.as_str().to_string(),
                beschreibung: entry.description_in(lang).unwrap_or_default().to_string(),
                menge: 1,
            });
        }
    }

    output.identified_leistungen = validated;
    output
}
