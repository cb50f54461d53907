//! Stage-2 helpers: mapping TARDOC items to package-condition equivalents
//! and ranking candidate packages.
//!
//! Both operations are advisory. Every suggestion is validated against the
//! structural candidate set; anything unknown is discarded.

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::catalog::types::Language;
use crate::catalog::{normalize_code, CatalogStore, TableCache};
use crate::pauschale::conditions::ConditionAtom;
use crate::pauschale::StructureIndex;

/// Functional-family narrowing for anaesthesia: TARDOC `AG.*` items map to
/// the `ANAST` table or the `WA.10.*` chapter.
const ANAESTHESIA_TARDOC_PREFIX: &str = "AG.";
const ANAESTHESIA_PACKAGE_PREFIX: &str = "WA.10.";
const ANAESTHESIA_TABLE: &str = "ANAST";

fn code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9.]+$").unwrap())
}

/// Collects every LKN referenced by the conditions of the potential
/// packages (literal lists and table expansions) with a description for the
/// mapping prompt.
pub fn collect_condition_lkns(
    potential: &BTreeSet<String>,
    store: &CatalogStore,
    index: &StructureIndex,
    cache: &mut TableCache,
    lang: Language,
) -> Vec<(String, String)> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut collected: Vec<(String, String)> = Vec::new();
    for package in potential {
        let structure = index.get_or_compile(package, store);
        for condition in &structure.conditions {
            match &condition.atom {
                ConditionAtom::LknList { codes } => {
                    for code in codes {
                        if seen.insert(code.clone()) {
                            collected.push((code.clone(), store.lkn_description(code, lang)));
                        }
                    }
                }
                ConditionAtom::LknTable { tables } => {
                    let entries =
                        store.table_entries(&tables.join(","), "service_catalog", lang, cache);
                    for entry in entries.iter() {
                        let code = normalize_code(&entry.code);
                        if seen.insert(code.clone()) {
                            let description = if entry.text == "N/A" {
                                store.lkn_description(&code, lang)
                            } else {
                                entry.text.clone()
                            };
                            collected.push((code, description));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    collected.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(count = collected.len(), "condition LKNs collected for mapping");
    collected
}

/// Restricts mapping candidates by functional family; currently anaesthesia
/// only. Falls back to the full set when the narrowed set would be empty.
pub fn narrow_candidates(
    tardoc_lkn: &str,
    candidates: &[(String, String)],
    store: &CatalogStore,
    cache: &mut TableCache,
) -> Vec<(String, String)> {
    if !tardoc_lkn.starts_with(ANAESTHESIA_TARDOC_PREFIX) {
        return candidates.to_vec();
    }
    let anast_codes: HashSet<String> = store
        .table_entries(ANAESTHESIA_TABLE, "service_catalog", Language::De, cache)
        .iter()
        .map(|e| normalize_code(&e.code))
        .collect();
    let narrowed: Vec<(String, String)> = candidates
        .iter()
        .filter(|(code, _)| {
            anast_codes.contains(code) || code.starts_with(ANAESTHESIA_PACKAGE_PREFIX)
        })
        .cloned()
        .collect();
    if narrowed.is_empty() {
        candidates.to_vec()
    } else {
        narrowed
    }
}

fn strip_markdown_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    let after = after
        .strip_prefix("json")
        .or_else(|| after.strip_prefix("JSON"))
        .unwrap_or(after);
    match after.find("```") {
        Some(end) => after[..end].trim(),
        None => trimmed,
    }
}

fn push_code(codes: &mut Vec<String>, raw: &str) {
    let code = normalize_code(&raw.replace('"', ""));
    if !code.is_empty() && code != "NONE" && !codes.contains(&code) {
        codes.push(code);
    }
}

/// Parses a mapping response in any of the tolerated shapes — bare comma
/// list, JSON array, JSON object with `EQUIVALENT_LKNS` — and unions the
/// extracted code sets in discovery order.
pub fn parse_mapping_codes(raw: &str) -> Vec<String> {
    let text = strip_markdown_fence(raw);
    if text.is_empty() || text.eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    let mut codes: Vec<String> = Vec::new();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        match &value {
            Value::Object(map) => {
                if let Some(Value::Array(items)) = map.get("EQUIVALENT_LKNS") {
                    for item in items {
                        if let Some(code) = item.as_str() {
                            push_code(&mut codes, code);
                        }
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    if let Some(code) = item.as_str() {
                        push_code(&mut codes, code);
                    }
                }
            }
            Value::String(s) => {
                for part in s.split(',') {
                    push_code(&mut codes, part);
                }
            }
            _ => {}
        }
    }
    for part in text.split(',') {
        push_code(&mut codes, part.trim());
    }
    codes
}

/// Maps a raw mapping response to the first suggested code that is actually
/// in the candidate set; `None` when the model declined or nothing is valid.
pub fn select_mapped_code(raw: &str, candidates: &[(String, String)]) -> Option<String> {
    let candidate_set: HashSet<&str> = candidates.iter().map(|(code, _)| code.as_str()).collect();
    for code in parse_mapping_codes(raw) {
        if candidate_set.contains(code.as_str()) {
            info!(mapped = %code, "mapping suggestion accepted");
            return Some(code);
        }
    }
    None
}

/// Parses the ranking response: comma-separated codes, cleaned of backticks,
/// filtered to the package code alphabet. `NONE` or garbage yields an empty
/// list, which means "keep the deterministic order".
pub fn parse_ranking_codes(raw: &str) -> Vec<String> {
    let cleaned = strip_markdown_fence(raw).replace('`', "");
    if cleaned.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    cleaned
        .split(',')
        .map(|part| normalize_code(part))
        .filter(|code| !code.is_empty() && code_regex().is_match(code))
        .collect()
}
