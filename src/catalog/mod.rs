//! Read-only in-memory catalogue store.
//!
//! Everything is loaded once at startup and immutable afterwards; request
//! handlers share the store by reference. Lookups are by upper-cased code or
//! lower-cased table name, so case never matters to callers.

pub mod load;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::rules::{parse_rules, Rule};

pub use types::{
    CatalogEntry, ConditionRow, EmbeddingRow, GroupRow, Language, PauschaleDef, RuleBookEntry,
    RuleRow, ServiceLinkRow, ServiceType, SynonymEntry, TableEntry, TableRow,
};

/// Normalises a table-type token: lowercase, dashes/underscores stripped,
/// historical synonyms collapsed (`402` and `tarif` both mean `tariff`).
pub fn normalize_table_type(raw: &str) -> String {
    let value: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect();
    match value.as_str() {
        "402" | "tarif" | "tariff" | "tarifposition" | "tarifpositionen" => "tariff".into(),
        "servicecatalog" | "servicekatalog" => "service_catalog".into(),
        "icd" | "icd10" => "icd".into(),
        _ => value,
    }
}

/// Canonical upper-case form of a service or diagnosis code.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Request-scoped memo for table lookups, keyed by (table names, type, lang).
/// Lives for the duration of one request; never shared across requests.
#[derive(Default)]
pub struct TableCache {
    entries: HashMap<(Vec<String>, String, Language), Arc<Vec<TableEntry>>>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct CatalogStore {
    entries: HashMap<String, CatalogEntry>,
    rules: HashMap<String, Vec<Rule>>,
    tables: HashMap<String, Vec<TableRow>>,
    pauschalen: HashMap<String, PauschaleDef>,
    conditions: HashMap<String, Vec<ConditionRow>>,
    service_links: HashMap<String, Vec<String>>,
    groups: HashMap<String, HashSet<String>>,
    synonyms: HashMap<String, Vec<String>>,
    tariff_version: String,
}

impl CatalogStore {
    pub fn new(
        catalog: Vec<CatalogEntry>,
        rule_book: Vec<RuleBookEntry>,
        table_rows: Vec<TableRow>,
        pauschalen: Vec<PauschaleDef>,
        condition_rows: Vec<ConditionRow>,
        link_rows: Vec<ServiceLinkRow>,
        group_rows: Vec<GroupRow>,
        synonym_entries: Vec<SynonymEntry>,
        tariff_version: String,
    ) -> Self {
        let mut entries = HashMap::new();
        for entry in catalog {
            entries.insert(normalize_code(&entry.lkn), entry);
        }

        let mut rules = HashMap::new();
        for entry in rule_book {
            rules.insert(normalize_code(&entry.lkn), parse_rules(&entry.rules));
        }

        let mut tables: HashMap<String, Vec<TableRow>> = HashMap::new();
        for row in table_rows {
            tables
                .entry(row.table.trim().to_lowercase())
                .or_default()
                .push(row);
        }

        let mut pauschalen_map = HashMap::new();
        for def in pauschalen {
            pauschalen_map.insert(normalize_code(&def.code), def);
        }

        let mut conditions: HashMap<String, Vec<ConditionRow>> = HashMap::new();
        for row in condition_rows {
            conditions
                .entry(normalize_code(&row.pauschale))
                .or_default()
                .push(row);
        }
        // Condition rows must keep their declared order inside each package.
        for rows in conditions.values_mut() {
            rows.sort_by_key(|r| r.id.unwrap_or(i64::MAX));
        }

        let mut service_links: HashMap<String, Vec<String>> = HashMap::new();
        for row in link_rows {
            let pc = normalize_code(&row.pauschale);
            if pauschalen_map.contains_key(&pc) {
                service_links
                    .entry(normalize_code(&row.lkn))
                    .or_default()
                    .push(pc);
            }
        }

        let mut groups: HashMap<String, HashSet<String>> = HashMap::new();
        for row in group_rows {
            groups
                .entry(normalize_code(&row.group))
                .or_default()
                .insert(normalize_code(&row.lkn));
        }

        let mut synonyms = HashMap::new();
        for entry in synonym_entries {
            synonyms.insert(entry.term.trim().to_lowercase(), entry.variants);
        }

        Self {
            entries,
            rules,
            tables,
            pauschalen: pauschalen_map,
            conditions,
            service_links,
            groups,
            synonyms,
            tariff_version,
        }
    }

    pub fn tariff_version(&self) -> &str {
        &self.tariff_version
    }

    pub fn code_details(&self, lkn: &str) -> Option<&CatalogEntry> {
        self.entries.get(&normalize_code(lkn))
    }

    pub fn contains_code(&self, lkn: &str) -> bool {
        self.entries.contains_key(&normalize_code(lkn))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &CatalogEntry)> {
        self.entries.iter()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn rules(&self, lkn: &str) -> &[Rule] {
        self.rules
            .get(&normalize_code(lkn))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn pauschale(&self, code: &str) -> Option<&PauschaleDef> {
        self.pauschalen.get(&normalize_code(code))
    }

    pub fn pauschalen(&self) -> impl Iterator<Item = (&String, &PauschaleDef)> {
        self.pauschalen.iter()
    }

    pub fn pauschale_conditions(&self, code: &str) -> &[ConditionRow] {
        self.conditions
            .get(&normalize_code(code))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_conditions(&self) -> impl Iterator<Item = (&String, &Vec<ConditionRow>)> {
        self.conditions.iter()
    }

    pub fn service_links(&self, lkn: &str) -> &[String] {
        self.service_links
            .get(&normalize_code(lkn))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn leistungsgruppe_members(&self, id: &str) -> Option<&HashSet<String>> {
        self.groups.get(&normalize_code(id))
    }

    pub fn leistungsgruppen(&self) -> &HashMap<String, HashSet<String>> {
        &self.groups
    }

    pub fn synonyms_for(&self, term: &str) -> Option<&[String]> {
        self.synonyms
            .get(&term.trim().to_lowercase())
            .map(Vec::as_slice)
    }

    /// Resolves a comma-separated table reference to its entries of the given
    /// type, deduplicated by code and sorted. Results are memoised in the
    /// request-scoped cache.
    pub fn table_entries(
        &self,
        table_ref: &str,
        table_type: &str,
        lang: Language,
        cache: &mut TableCache,
    ) -> Arc<Vec<TableEntry>> {
        let names: Vec<String> = table_ref
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        let requested = normalize_table_type(table_type);
        let key = (names.clone(), requested.clone(), lang);
        if let Some(hit) = cache.entries.get(&key) {
            return Arc::clone(hit);
        }

        let mut collected: HashMap<String, TableEntry> = HashMap::new();
        for name in &names {
            let Some(rows) = self.tables.get(name) else {
                tracing::debug!(table = %name, "table reference not found in catalogue");
                continue;
            };
            for row in rows {
                let row_type = row
                    .table_type
                    .as_deref()
                    .map(normalize_table_type)
                    .unwrap_or_default();
                if !requested.is_empty() && !row_type.is_empty() && row_type != requested {
                    continue;
                }
                if row.code.is_empty() {
                    continue;
                }
                collected.insert(
                    row.code.clone(),
                    TableEntry {
                        code: row.code.clone(),
                        text: row.text_in(lang).unwrap_or("N/A").to_string(),
                    },
                );
            }
        }
        let mut result: Vec<TableEntry> = collected.into_values().collect();
        result.sort_by(|a, b| a.code.cmp(&b.code));

        let result = Arc::new(result);
        cache.entries.insert(key, Arc::clone(&result));
        result
    }

    /// Lower-cased names of all service-catalog tables containing the code.
    pub fn tables_containing(&self, lkn: &str, table_type: &str) -> HashSet<String> {
        let code = normalize_code(lkn);
        let requested = normalize_table_type(table_type);
        let mut result = HashSet::new();
        for (name, rows) in &self.tables {
            for row in rows {
                if !normalize_code(&row.code).eq(&code) {
                    continue;
                }
                let row_type = row
                    .table_type
                    .as_deref()
                    .map(normalize_table_type)
                    .unwrap_or_default();
                if requested.is_empty() || row_type.is_empty() || row_type == requested {
                    result.insert(name.clone());
                    break;
                }
            }
        }
        result
    }

    /// Localised description of a service code; falls back to the code itself.
    pub fn lkn_description(&self, lkn: &str, lang: Language) -> String {
        self.code_details(lkn)
            .and_then(|e| e.description_in(lang))
            .unwrap_or(lkn)
            .to_string()
    }

    /// Localised description of an ICD code, scanning all icd-typed tables.
    pub fn icd_description(&self, icd: &str, lang: Language) -> String {
        let code = normalize_code(icd);
        for rows in self.tables.values() {
            for row in rows {
                let row_type = row
                    .table_type
                    .as_deref()
                    .map(normalize_table_type)
                    .unwrap_or_default();
                if row_type == "icd" && normalize_code(&row.code) == code {
                    if let Some(text) = row.text_in(lang) {
                        return text.to_string();
                    }
                }
            }
        }
        code
    }

    /// Substring search over icd-typed table entries (UI search endpoint).
    pub fn search_icd(&self, query: &str, lang: Language, limit: usize) -> Vec<TableEntry> {
        self.search_tables(query, "icd", lang, limit)
    }

    /// Substring search over tariff-typed table entries (UI search endpoint).
    pub fn search_chop(&self, query: &str, lang: Language, limit: usize) -> Vec<TableEntry> {
        self.search_tables(query, "tariff", lang, limit)
    }

    fn search_tables(
        &self,
        query: &str,
        table_type: &str,
        lang: Language,
        limit: usize,
    ) -> Vec<TableEntry> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let requested = normalize_table_type(table_type);
        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        for rows in self.tables.values() {
            for row in rows {
                let row_type = row
                    .table_type
                    .as_deref()
                    .map(normalize_table_type)
                    .unwrap_or_default();
                if row_type != requested {
                    continue;
                }
                let text = row.text_in(lang).unwrap_or("");
                if row.code.to_lowercase().contains(&needle)
                    || text.to_lowercase().contains(&needle)
                {
                    if seen.insert(row.code.clone()) {
                        hits.push(TableEntry {
                            code: row.code.clone(),
                            text: text.to_string(),
                        });
                    }
                }
            }
        }
        hits.sort_by(|a, b| a.code.cmp(&b.code));
        hits.truncate(limit);
        hits
    }
}
