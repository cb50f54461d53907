//! Package candidate enumeration, ranking and selection.
//!
//! Candidates come from the service-links table plus every package whose
//! conditions reference a rule-passing code (literally or via a table).
//! Survivors of the structural filter are ranked deterministically; an
//! advisory LLM ranking only breaks ties that the deterministic keys leave.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info};

use crate::catalog::types::{Language, TableEntry};
use crate::catalog::{normalize_code, CatalogStore, TableCache};
use crate::context::BillingContext;
use crate::i18n::translate;

use super::conditions::{
    evaluate_structure, CompiledStructure, ConditionAtom, ConditionOutcome, StructureIndex,
};
use super::render::{render_condition_results, render_explanation, SiblingDiff};

/// Packages starting with this prefix are catch-all fallbacks and rank after
/// every specific candidate.
const FALLBACK_PREFIX: &str = "C9";

fn family_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Z0-9.]+)[A-Z]$").unwrap())
}

/// Base family of a package code (`C08.50E` → `C08.50`), when it has one.
pub fn base_family(code: &str) -> Option<&str> {
    family_regex()
        .captures(code)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Enumerates every package that references one of the rule-passing codes:
/// (a) via the service-links table, (b) as a literal in an LKN list
/// condition, (c) via an LKN table the code belongs to.
pub fn collect_candidates(
    rule_passing_lkns: &[String],
    store: &CatalogStore,
    index: &StructureIndex,
) -> BTreeSet<String> {
    let codes: Vec<String> = rule_passing_lkns.iter().map(|c| normalize_code(c)).collect();
    let mut candidates = BTreeSet::new();

    for code in &codes {
        for package in store.service_links(code) {
            candidates.insert(package.clone());
        }
    }

    let mut member_tables: HashMap<&String, HashSet<String>> = HashMap::new();
    for code in &codes {
        member_tables.insert(code, store.tables_containing(code, "service_catalog"));
    }

    for (package, _) in store.all_conditions() {
        if store.pauschale(package).is_none() {
            continue;
        }
        let structure = index.get_or_compile(package, store);
        if structure_references_any(&structure, &codes, &member_tables) {
            candidates.insert(package.clone());
        }
    }

    debug!(count = candidates.len(), "package candidates enumerated");
    candidates
}

fn structure_references_any(
    structure: &CompiledStructure,
    codes: &[String],
    member_tables: &HashMap<&String, HashSet<String>>,
) -> bool {
    structure.conditions.iter().any(|condition| match &condition.atom {
        ConditionAtom::LknList { codes: listed } => {
            codes.iter().any(|code| listed.contains(code))
        }
        ConditionAtom::LknTable { tables } => codes.iter().any(|code| {
            member_tables
                .get(code)
                .is_some_and(|memberships| tables.iter().any(|t| memberships.contains(t)))
        }),
        _ => false,
    })
}

/// Number of distinct rule-passing codes appearing in the package's LKN
/// atoms. Higher count means a more specific structural match.
fn lkn_match_count(
    structure: &CompiledStructure,
    codes: &[String],
    member_tables: &HashMap<&String, HashSet<String>>,
) -> usize {
    codes
        .iter()
        .filter(|code| {
            structure.conditions.iter().any(|condition| match &condition.atom {
                ConditionAtom::LknList { codes: listed } => listed.contains(*code),
                ConditionAtom::LknTable { tables } => member_tables
                    .get(*code)
                    .is_some_and(|memberships| tables.iter().any(|t| memberships.contains(t))),
                _ => false,
            })
        })
        .count()
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EvaluatedCandidate {
    pub code: String,
    #[serde(rename = "bedingungs_pruef_html")]
    pub condition_html: String,
    #[serde(skip)]
    pub applicable: bool,
}

#[derive(Debug, Clone)]
pub struct SelectedPackage {
    pub code: String,
    pub text: String,
    pub tax_points: Option<serde_json::Value>,
    pub explanation_html: String,
    pub condition_html: String,
    pub condition_errors: Vec<String>,
    pub potential_icds: Vec<TableEntry>,
}

#[derive(Debug, Clone)]
pub enum Selection {
    Selected(Box<SelectedPackage>),
    /// Candidates existed but none passed the structural filter.
    NoneApplicable { evaluated: Vec<EvaluatedCandidate> },
    /// No package references any rule-passing code.
    NoCandidates,
}

/// Runs the structural filter over the candidate set and selects the winner.
///
/// Ranking keys, most significant first: LKN match count (descending), ICD
/// preference when `use_icd` is off, specific before `C9…` fallbacks, the
/// advisory LLM rank, code ascending. Deterministic for fixed inputs.
#[allow(clippy::too_many_arguments)]
pub fn determine_applicable_package(
    context: &BillingContext,
    candidates: &BTreeSet<String>,
    rule_passing_lkns: &[String],
    llm_ranking: &[String],
    store: &CatalogStore,
    index: &StructureIndex,
    cache: &mut TableCache,
    strict: bool,
) -> Selection {
    if candidates.is_empty() {
        return Selection::NoCandidates;
    }
    let lang = context.lang;
    let codes: Vec<String> = rule_passing_lkns.iter().map(|c| normalize_code(c)).collect();
    let mut member_tables: HashMap<&String, HashSet<String>> = HashMap::new();
    for code in &codes {
        member_tables.insert(code, store.tables_containing(code, "service_catalog"));
    }

    let rank_of: HashMap<String, usize> = llm_ranking
        .iter()
        .enumerate()
        .map(|(i, code)| (normalize_code(code), i))
        .collect();

    let mut evaluated: Vec<EvaluatedCandidate> = Vec::new();
    let mut applicable: Vec<(String, ConditionOutcome)> = Vec::new();

    for code in candidates {
        let structure = index.get_or_compile(code, store);
        let outcome = evaluate_structure(&structure, context, store, cache, strict);
        evaluated.push(EvaluatedCandidate {
            code: code.clone(),
            condition_html: render_condition_results(&outcome, store, lang, cache),
            applicable: outcome.applicable,
        });
        if outcome.applicable {
            applicable.push((code.clone(), outcome));
        }
    }

    if applicable.is_empty() {
        info!("no candidate package passed its conditions");
        return Selection::NoneApplicable { evaluated };
    }

    applicable.sort_by_key(|(code, outcome)| {
        let structure = index.get_or_compile(code, store);
        let match_count = lkn_match_count(&structure, &codes, &member_tables);
        let has_icd_condition = outcome.results.iter().any(|r| r.atom.is_icd());
        (
            std::cmp::Reverse(match_count),
            !context.use_icd && has_icd_condition,
            code.starts_with(FALLBACK_PREFIX),
            rank_of.get(code).copied().unwrap_or(usize::MAX),
            code.clone(),
        )
    });

    let (winner_code, winner_outcome) = applicable.remove(0);
    info!(winner = %winner_code, "package selected");

    let definition = store.pauschale(&winner_code);
    let text = definition
        .and_then(|d| d.text_in(lang))
        .unwrap_or(&winner_code)
        .to_string();
    let tax_points = definition.and_then(|d| d.tax_points.clone());

    let winner_structure = index.get_or_compile(&winner_code, store);
    let siblings = sibling_diffs(&winner_code, &winner_structure, store, index, lang);
    let explanation_html = render_explanation(
        &winner_code,
        &text,
        &winner_outcome,
        &siblings,
        store,
        lang,
        cache,
    );
    let condition_html = evaluated
        .iter()
        .find(|e| e.code == winner_code)
        .map(|e| e.condition_html.clone())
        .unwrap_or_default();
    let potential_icds = harvest_potential_icds(&winner_structure, store, lang, cache);

    Selection::Selected(Box::new(SelectedPackage {
        code: winner_code,
        text,
        tax_points,
        explanation_html,
        condition_html,
        condition_errors: winner_outcome.errors,
        potential_icds,
    }))
}

/// Differences between the winner and each package of the same base family,
/// computed on the simplified condition tuples.
fn sibling_diffs(
    winner: &str,
    winner_structure: &CompiledStructure,
    store: &CatalogStore,
    index: &StructureIndex,
    lang: Language,
) -> Vec<SiblingDiff> {
    let Some(base) = base_family(winner) else {
        return Vec::new();
    };
    let winner_tuples: HashSet<(String, String)> = winner_structure
        .conditions
        .iter()
        .map(|c| c.atom.simplified())
        .collect();

    let mut siblings: Vec<SiblingDiff> = Vec::new();
    let mut codes: Vec<&String> = store
        .pauschalen()
        .map(|(code, _)| code)
        .filter(|code| *code != winner && base_family(code) == Some(base))
        .collect();
    codes.sort();

    for code in codes {
        let structure = index.get_or_compile(code, store);
        let sibling_tuples: HashSet<(String, String)> = structure
            .conditions
            .iter()
            .map(|c| c.atom.simplified())
            .collect();

        let mut added: Vec<ConditionAtom> = Vec::new();
        let mut seen = HashSet::new();
        for condition in &structure.conditions {
            let tuple = condition.atom.simplified();
            if !winner_tuples.contains(&tuple) && seen.insert(tuple) {
                added.push(condition.atom.clone());
            }
        }
        let mut missing: Vec<ConditionAtom> = Vec::new();
        let mut seen = HashSet::new();
        for condition in &winner_structure.conditions {
            let tuple = condition.atom.simplified();
            if !sibling_tuples.contains(&tuple) && seen.insert(tuple) {
                missing.push(condition.atom.clone());
            }
        }

        let text = store
            .pauschale(code)
            .and_then(|d| d.text_in(lang))
            .unwrap_or(code)
            .to_string();
        siblings.push(SiblingDiff {
            code: code.clone(),
            text,
            added,
            missing,
        });
    }
    siblings
}

/// All ICDs referenced by the winner's ICD table conditions — the diagnoses
/// that would have (or did) activate the package.
fn harvest_potential_icds(
    structure: &CompiledStructure,
    store: &CatalogStore,
    lang: Language,
    cache: &mut TableCache,
) -> Vec<TableEntry> {
    let mut collected: HashMap<String, TableEntry> = HashMap::new();
    for condition in &structure.conditions {
        if let ConditionAtom::IcdTable { tables } = &condition.atom {
            let entries = store.table_entries(&tables.join(","), "icd", lang, cache);
            for entry in entries.iter() {
                collected.entry(entry.code.clone()).or_insert_with(|| entry.clone());
            }
        }
    }
    let mut result: Vec<TableEntry> = collected.into_values().collect();
    result.sort_by(|a, b| a.code.cmp(&b.code));
    result
}

/// Localised message for the non-applicable outcome.
pub fn no_applicable_message(lang: Language) -> String {
    translate("no_package_applicable", lang).to_string()
}

/// Localised message for the no-candidates outcome.
pub fn no_candidates_message(lang: Language) -> String {
    translate("no_package_candidates", lang).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::{
        ConditionRow, PauschaleDef, ServiceLinkRow, TableRow,
    };

    fn pauschale(code: &str, text: &str, tp: &str) -> PauschaleDef {
        serde_json::from_value(serde_json::json!({
            "Pauschale": code, "Pauschale_Text": text, "Taxpunkte": tp
        }))
        .unwrap()
    }

    fn condition(value: serde_json::Value) -> ConditionRow {
        serde_json::from_value(value).unwrap()
    }

    fn build_store(
        pauschalen: Vec<PauschaleDef>,
        conditions: Vec<ConditionRow>,
        links: Vec<ServiceLinkRow>,
        tables: Vec<TableRow>,
    ) -> CatalogStore {
        CatalogStore::new(
            Vec::new(),
            Vec::new(),
            tables,
            pauschalen,
            conditions,
            links,
            Vec::new(),
            Vec::new(),
            "test".into(),
        )
    }

    fn select(
        store: &CatalogStore,
        context: &BillingContext,
        candidates: &BTreeSet<String>,
        lkns: &[String],
    ) -> Selection {
        let index = StructureIndex::new();
        let mut cache = TableCache::new();
        determine_applicable_package(
            context, candidates, lkns, &[], store, &index, &mut cache, false,
        )
    }

    #[test]
    fn no_candidates_yields_error_path() {
        let store = build_store(Vec::new(), Vec::new(), Vec::new(), Vec::new());
        let context = BillingContext::default();
        let selection = select(&store, &context, &BTreeSet::new(), &[]);
        assert!(matches!(selection, Selection::NoCandidates));
    }

    #[test]
    fn candidates_without_valid_conditions_report_evaluations() {
        let store = build_store(
            vec![pauschale("X00.01A", "x", "1")],
            vec![condition(serde_json::json!({
                "Pauschale": "X00.01A", "Bedingungstyp": "LKN", "Werte": "A.AA.0001"
            }))],
            Vec::new(),
            Vec::new(),
        );
        let context = BillingContext::default();
        let candidates = BTreeSet::from(["X00.01A".to_string()]);
        let selection = select(&store, &context, &candidates, &[]);
        match selection {
            Selection::NoneApplicable { evaluated } => {
                assert_eq!(evaluated.len(), 1);
                assert!(evaluated[0].condition_html.starts_with('<'));
            }
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn specific_candidate_preferred_over_fallback() {
        let store = build_store(
            vec![
                pauschale("X00.01A", "Spezifisch", "50"),
                pauschale("C90.01A", "Fallback", "100"),
            ],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let context = BillingContext {
            lkn_codes: vec!["A.AA.0001".into()],
            ..Default::default()
        }
        .normalized();
        let candidates = BTreeSet::from(["X00.01A".to_string(), "C90.01A".to_string()]);
        match select(&store, &context, &candidates, &[]) {
            Selection::Selected(selected) => assert_eq!(selected.code, "X00.01A"),
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn higher_lkn_match_count_wins() {
        let store = build_store(
            vec![pauschale("A", "Jaw", "120"), pauschale("B", "Sedation", "300")],
            vec![
                condition(serde_json::json!({
                    "Pauschale": "A", "BedingungsID": 1, "Gruppe": 1, "Operator": "UND",
                    "Bedingungstyp": "LEISTUNGSPOSITIONEN IN LISTE", "Werte": "Y.AA.0001"
                })),
                condition(serde_json::json!({
                    "Pauschale": "A", "BedingungsID": 2, "Gruppe": 1, "Operator": "UND",
                    "Bedingungstyp": "LEISTUNGSPOSITIONEN IN LISTE", "Werte": "X.AA.0001"
                })),
                condition(serde_json::json!({
                    "Pauschale": "B", "BedingungsID": 3, "Gruppe": 1, "Operator": "UND",
                    "Bedingungstyp": "LEISTUNGSPOSITIONEN IN LISTE", "Werte": "X.AA.0001"
                })),
            ],
            Vec::new(),
            Vec::new(),
        );
        let context = BillingContext {
            lkn_codes: vec!["X.AA.0001".into(), "Y.AA.0001".into()],
            use_icd: false,
            ..Default::default()
        }
        .normalized();
        let candidates = BTreeSet::from(["A".to_string(), "B".to_string()]);
        match select(
            &store,
            &context,
            &candidates,
            &["X.AA.0001".to_string(), "Y.AA.0001".to_string()],
        ) {
            Selection::Selected(selected) => assert_eq!(selected.code, "A"),
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn use_icd_false_prefers_icd_free_candidate() {
        let store = build_store(
            vec![
                pauschale("A", "ICD-Pauschale", "200"),
                pauschale("B", "Ohne ICD", "150"),
            ],
            vec![
                condition(serde_json::json!({
                    "Pauschale": "A", "Bedingungstyp": "ICD", "Werte": "S03.0"
                })),
                condition(serde_json::json!({
                    "Pauschale": "B", "Bedingungstyp": "LKN", "Werte": "X.AA.0001"
                })),
            ],
            Vec::new(),
            Vec::new(),
        );
        let context = BillingContext {
            lkn_codes: vec!["X.AA.0001".into()],
            use_icd: false,
            ..Default::default()
        }
        .normalized();
        let candidates = BTreeSet::from(["A".to_string(), "B".to_string()]);
        match select(&store, &context, &candidates, &["X.AA.0001".to_string()]) {
            Selection::Selected(selected) => assert_eq!(selected.code, "B"),
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn fallback_tier_breaks_ties_by_code_ascending() {
        let store = build_store(
            vec![pauschale("C90.01A", "F1", "100"), pauschale("C90.01B", "F2", "200")],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let context = BillingContext {
            lkn_codes: vec!["A.AA.0001".into()],
            ..Default::default()
        }
        .normalized();
        let candidates = BTreeSet::from(["C90.01A".to_string(), "C90.01B".to_string()]);
        match select(&store, &context, &candidates, &[]) {
            Selection::Selected(selected) => assert_eq!(selected.code, "C90.01A"),
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn candidate_enumeration_covers_links_lists_and_tables() {
        let store = build_store(
            vec![
                pauschale("P1", "via Link", "1"),
                pauschale("P2", "via Liste", "1"),
                pauschale("P3", "via Tabelle", "1"),
            ],
            vec![
                condition(serde_json::json!({
                    "Pauschale": "P2", "Bedingungstyp": "LEISTUNGSPOSITIONEN IN LISTE",
                    "Werte": "C03.GC.0200"
                })),
                condition(serde_json::json!({
                    "Pauschale": "P3", "Bedingungstyp": "LEISTUNGSPOSITIONEN IN TABELLE",
                    "Werte": "OR"
                })),
            ],
            vec![serde_json::from_value(serde_json::json!({
                "Leistungsposition": "C03.GC.0200", "Pauschale": "P1"
            }))
            .unwrap()],
            vec![serde_json::from_value(serde_json::json!({
                "Tabelle": "or", "Tabelle_Typ": "service_catalog",
                "Code": "C03.GC.0200", "Code_Text": "Bronchoskopie"
            }))
            .unwrap()],
        );
        let index = StructureIndex::new();
        let candidates =
            collect_candidates(&["c03.gc.0200".to_string()], &store, &index);
        assert_eq!(
            candidates,
            BTreeSet::from(["P1".to_string(), "P2".to_string(), "P3".to_string()])
        );
    }

    #[test]
    fn winner_collects_potential_icds_from_tables() {
        let store = build_store(
            vec![pauschale("C08.50E", "Kiefergelenk", "120")],
            vec![
                condition(serde_json::json!({
                    "Pauschale": "C08.50E", "BedingungsID": 1, "Gruppe": 1, "Operator": "UND",
                    "Bedingungstyp": "LEISTUNGSPOSITIONEN IN LISTE", "Werte": "C08.EC.0130"
                })),
                condition(serde_json::json!({
                    "Pauschale": "C08.50E", "BedingungsID": 2, "Gruppe": 2, "Operator": "UND",
                    "Bedingungstyp": "HAUPTDIAGNOSE IN TABELLE", "Werte": "kiefer_icd"
                })),
            ],
            Vec::new(),
            vec![
                serde_json::from_value(serde_json::json!({
                    "Tabelle": "kiefer_icd", "Tabelle_Typ": "icd",
                    "Code": "S03.0", "Code_Text": "Luxation des Kiefers"
                }))
                .unwrap(),
                serde_json::from_value(serde_json::json!({
                    "Tabelle": "kiefer_icd", "Tabelle_Typ": "icd",
                    "Code": "K07.6", "Code_Text": "Kiefergelenkkrankheit"
                }))
                .unwrap(),
            ],
        );
        let context = BillingContext {
            lkn_codes: vec!["C08.EC.0130".into()],
            use_icd: false,
            ..Default::default()
        }
        .normalized();
        let candidates = BTreeSet::from(["C08.50E".to_string()]);
        match select(&store, &context, &candidates, &["C08.EC.0130".to_string()]) {
            Selection::Selected(selected) => {
                let codes: Vec<&str> =
                    selected.potential_icds.iter().map(|e| e.code.as_str()).collect();
                assert_eq!(codes, vec!["K07.6", "S03.0"]);
                assert!(selected.explanation_html.contains("C08.50E"));
            }
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn llm_ranking_only_breaks_full_ties() {
        let store = build_store(
            vec![pauschale("X00.01A", "A", "1"), pauschale("X00.01B", "B", "1")],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let context = BillingContext::default();
        let candidates = BTreeSet::from(["X00.01A".to_string(), "X00.01B".to_string()]);
        let index = StructureIndex::new();
        let mut cache = TableCache::new();
        let selection = determine_applicable_package(
            &context,
            &candidates,
            &[],
            &["X00.01B".to_string()],
            &store,
            &index,
            &mut cache,
            false,
        );
        match selection {
            Selection::Selected(selected) => assert_eq!(selected.code, "X00.01B"),
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn base_family_extraction() {
        assert_eq!(base_family("C08.50E"), Some("C08.50"));
        assert_eq!(base_family("C90.01B"), Some("C90.01"));
        assert_eq!(base_family("123"), None);
    }
}
