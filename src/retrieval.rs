//! Catalogue retrieval: builds the bounded candidate-code context for the
//! Stage-1 prompt from free text.
//!
//! Keyword scoring weights token occurrences by inverse document frequency
//! over the multilingual description fields; an optional pre-built embedding
//! index contributes a cosine-similarity component. Literal catalogue codes
//! found in the text are always forced into the context.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::catalog::types::{EmbeddingRow, Language};
use crate::catalog::{normalize_code, CatalogStore};

/// Default size of the LLM context window (codes).
pub const DEFAULT_CONTEXT_LIMIT: usize = 200;

/// German directional prefixes expanded during compound splitting, and the
/// bases that must never be split (they only look like compounds).
const COMPOUND_PREFIXES: &[&str] = &["links", "rechts", "ober", "unter", "innen", "aussen"];
const COMPOUND_EXCLUDED: &[&str] = &["untersuchung", "unterwegs"];

/// Very common words that drown out the useful tokens: function words,
/// indefinite articles, pure laterality terms and gender nouns.
const STOPWORDS: &[&str] = &[
    "und", "oder", "die", "der", "das", "des", "durch", "mit", "von", "im", "in", "für", "per",
    "unter", "suchung", "untersuchung", "mann", "frau", "männlich", "weiblich", "eine", "einer",
    "eines", "einem", "einen", "rechts", "rechte", "rechter", "rechten", "links", "linke",
    "linken", "linker", "beidseits",
];

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").unwrap())
}

fn lkn_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[A-Z][A-Z0-9]{1,2}\.[A-Z0-9]{2}\.[0-9]{4}\b").unwrap()
    })
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+|[^\w\s]").unwrap())
}

/// Naive token count used for the per-stage usage accounting.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    token_regex().find_iter(text).count()
}

/// Appends split variants of directional compounds to the text so base terms
/// hidden inside them become searchable (`Linksherzkatheter` →
/// `links herzkatheter` + `herzkatheter`).
pub fn expand_compound_words(text: &str) -> String {
    let mut additions: Vec<String> = Vec::new();
    for token in word_regex().find_iter(text) {
        let token = token.as_str();
        let lowered = token.to_lowercase();
        if COMPOUND_EXCLUDED.contains(&lowered.as_str()) {
            continue;
        }
        for prefix in COMPOUND_PREFIXES {
            if lowered.starts_with(prefix) && lowered.chars().count() > prefix.len() + 2 {
                let base: String = token.chars().skip(prefix.chars().count()).collect();
                additions.push(format!("{prefix} {base}"));
                additions.push(base);
                break;
            }
        }
    }
    if additions.is_empty() {
        text.to_string()
    } else {
        format!("{text} {}", additions.join(" "))
    }
}

/// Keyword set of a text: compound-expanded, lower-cased tokens of at least
/// four characters that are not stopwords.
pub fn extract_keywords(text: &str) -> HashSet<String> {
    let expanded = expand_compound_words(text);
    word_regex()
        .find_iter(&expanded.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|t| t.chars().count() >= 4 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Literal service codes mentioned in the text, canonical upper-case.
pub fn extract_lkn_codes(text: &str) -> Vec<String> {
    lkn_code_regex()
        .find_iter(text)
        .map(|m| normalize_code(m.as_str()))
        .collect()
}

fn entry_search_text(entry: &crate::catalog::CatalogEntry) -> String {
    let fields = [
        entry.description.as_deref(),
        entry.description_fr.as_deref(),
        entry.description_it.as_deref(),
        entry.interpretation.as_deref(),
        entry.interpretation_fr.as_deref(),
        entry.interpretation_it.as_deref(),
    ];
    fields.into_iter().flatten().collect::<Vec<_>>().join(" ")
}

/// Document frequency of every keyword over the catalogue descriptions.
/// Computed once at startup.
pub fn compute_token_doc_freq(store: &CatalogStore) -> HashMap<String, usize> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for (_, entry) in store.entries() {
        for token in extract_keywords(&entry_search_text(entry)) {
            *freq.entry(token).or_insert(0) += 1;
        }
    }
    freq
}

/// Ranks catalogue entries by keyword score: Σ occurrences · 1/doc-frequency
/// across the description fields. Returns `(score, code)` pairs, best first.
pub fn rank_catalog_entries(
    tokens: &HashSet<String>,
    store: &CatalogStore,
    doc_freq: &HashMap<String, usize>,
    limit: usize,
) -> Vec<(f64, String)> {
    let mut scored: Vec<(f64, String)> = Vec::new();
    for (code, entry) in store.entries() {
        let combined = expand_compound_words(&entry_search_text(entry)).to_lowercase();
        let mut score = 0.0;
        for token in tokens {
            let occurrences = combined.matches(token.as_str()).count();
            if occurrences > 0 {
                let df = doc_freq.get(token).copied().unwrap_or(store.entry_count());
                if df > 0 {
                    score += occurrences as f64 / df as f64;
                }
            }
        }
        if score > 0.0 {
            scored.push((score, code.clone()));
        }
    }
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    scored.truncate(limit);
    scored
}

/// Pre-built embedding index over catalogue descriptions. The vectors are an
/// offline artefact; scoring is a brute-force cosine pass, which is well
/// within budget for catalogue-sized inputs.
pub struct EmbeddingIndex {
    codes: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl EmbeddingIndex {
    pub fn from_rows(rows: Vec<EmbeddingRow>) -> Self {
        let mut codes = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());
        for row in rows {
            codes.push(normalize_code(&row.lkn));
            vectors.push(normalize_unit(row.vector));
        }
        Self { codes, vectors }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Codes ranked by cosine similarity to the query vector.
    pub fn rank(&self, query: &[f32], limit: usize) -> Vec<(f64, String)> {
        let query = normalize_unit(query.to_vec());
        let mut scored: Vec<(f64, String)> = self
            .codes
            .iter()
            .zip(&self.vectors)
            .map(|(code, vector)| (dot(&query, vector) as f64, code.clone()))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        scored.truncate(limit);
        scored
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize_unit(mut v: Vec<f32>) -> Vec<f32> {
    let norm = dot(&v, &v).sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Fuses keyword and vector rankings into one ordered code list using the
/// configured weights. Codes present in only one ranking keep that
/// component; ties resolve by code.
pub fn fuse_rankings(
    keyword: &[(f64, String)],
    vector: &[(f64, String)],
    keyword_weight: f64,
    vector_weight: f64,
    limit: usize,
) -> Vec<String> {
    let mut combined: HashMap<String, f64> = HashMap::new();
    for (score, code) in keyword {
        *combined.entry(code.clone()).or_insert(0.0) += keyword_weight * score;
    }
    for (score, code) in vector {
        *combined.entry(code.clone()).or_insert(0.0) += vector_weight * score;
    }
    let mut scored: Vec<(f64, String)> =
        combined.into_iter().map(|(code, score)| (score, code)).collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(_, code)| code).collect()
}

/// Builds the Stage-1 catalogue context: ranked candidates plus any literal
/// codes from the raw text, rendered one entry per line.
pub fn build_context_window(
    user_text: &str,
    lang: Language,
    store: &CatalogStore,
    doc_freq: &HashMap<String, usize>,
    embeddings: Option<(&EmbeddingIndex, &[f32])>,
    weights: (f64, f64),
    limit: usize,
) -> (Vec<String>, String) {
    let tokens = extract_keywords(user_text);
    let keyword_ranking = rank_catalog_entries(&tokens, store, doc_freq, limit);
    let mut codes = match embeddings {
        Some((index, query)) if !index.is_empty() => {
            let vector_ranking = index.rank(query, limit);
            fuse_rankings(&keyword_ranking, &vector_ranking, weights.0, weights.1, limit)
        }
        _ => keyword_ranking.into_iter().map(|(_, code)| code).collect(),
    };

    // Literal codes in the text always make it into the window.
    for code in extract_lkn_codes(user_text) {
        if store.contains_code(&code) && !codes.contains(&code) {
            codes.insert(0, code);
        }
    }
    codes.truncate(limit.max(1));

    let mut lines = String::new();
    for code in &codes {
        if let Some(entry) = store.code_details(code) {
            lines.push_str(&format!(
                "LKN: {}, Typ: {}, Beschreibung: {}\n",
                code,
                entry.typ.as_str(),
                entry.description_in(lang).unwrap_or("N/A")
            ));
        }
    }
    (codes, lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;

    fn entry(lkn: &str, typ: &str, description: &str) -> crate::catalog::CatalogEntry {
        serde_json::from_value(serde_json::json!({
            "LKN": lkn, "Typ": typ, "Beschreibung": description
        }))
        .unwrap()
    }

    fn store() -> CatalogStore {
        CatalogStore::new(
            vec![
                entry("AA.00.0010", "E", "Ärztliche Konsultation, erste 5 Min."),
                entry("AA.00.0020", "E", "Ärztliche Konsultation, jede weitere 1 Min."),
                entry("C03.GC.0200", "P", "Bronchoskopie mit Lavage"),
                entry("C05.GC.0100", "P", "Herzkatheter Untersuchung links"),
            ],
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

    #[test]
    fn compound_expansion_splits_directional_prefixes() {
        let expanded = expand_compound_words("Linksherzkatheter");
        assert!(expanded.contains("links herzkatheter"));
        assert!(expanded.contains("herzkatheter"));
    }

    #[test]
    fn compound_expansion_skips_excluded_bases() {
        assert_eq!(expand_compound_words("Untersuchung"), "Untersuchung");
        assert_eq!(expand_compound_words("unterwegs"), "unterwegs");
    }

    #[test]
    fn keywords_drop_short_tokens_and_stopwords() {
        let keywords = extract_keywords("Bronchoskopie mit der Lavage und BAL");
        assert!(keywords.contains("bronchoskopie"));
        assert!(keywords.contains("lavage"));
        assert!(!keywords.contains("mit"));
        assert!(!keywords.contains("bal"));
    }

    #[test]
    fn laterality_terms_are_stopwords_but_split_bases_survive() {
        let keywords = extract_keywords("Linksherzkatheter");
        assert!(keywords.contains("herzkatheter"));
        assert!(!keywords.contains("links"));
    }

    #[test]
    fn literal_codes_extracted_case_insensitively() {
        let codes = extract_lkn_codes("siehe c08.sa.0700 und GG.15.0330");
        assert_eq!(codes, vec!["C08.SA.0700", "GG.15.0330"]);
    }

    #[test]
    fn ranking_prefers_matching_entries() {
        let store = store();
        let doc_freq = compute_token_doc_freq(&store);
        let tokens = extract_keywords("Bronchoskopie mit Lavage");
        let ranked = rank_catalog_entries(&tokens, &store, &doc_freq, 10);
        assert_eq!(ranked[0].1, "C03.GC.0200");
    }

    #[test]
    fn rare_tokens_outweigh_common_ones() {
        let store = store();
        let doc_freq = compute_token_doc_freq(&store);
        // "konsultation" appears in two entries, "bronchoskopie" in one.
        let tokens = extract_keywords("Konsultation Bronchoskopie");
        let ranked = rank_catalog_entries(&tokens, &store, &doc_freq, 10);
        assert_eq!(ranked[0].1, "C03.GC.0200");
    }

    #[test]
    fn context_window_forces_literal_codes() {
        let store = store();
        let doc_freq = compute_token_doc_freq(&store);
        let (codes, text) = build_context_window(
            "Kontrolle AA.00.0010 nach Eingriff",
            Language::De,
            &store,
            &doc_freq,
            None,
            (1.0, 0.0),
            5,
        );
        assert!(codes.contains(&"AA.00.0010".to_string()));
        assert!(text.contains("LKN: AA.00.0010"));
    }

    #[test]
    fn embedding_index_ranks_by_cosine() {
        let index = EmbeddingIndex::from_rows(vec![
            serde_json::from_value(serde_json::json!({"lkn": "AA.00.0010", "vector": [1.0, 0.0]}))
                .unwrap(),
            serde_json::from_value(serde_json::json!({"lkn": "C03.GC.0200", "vector": [0.0, 1.0]}))
                .unwrap(),
        ]);
        let ranked = index.rank(&[0.1, 0.9], 2);
        assert_eq!(ranked[0].1, "C03.GC.0200");
    }

    #[test]
    fn fusion_combines_weighted_scores() {
        let keyword = vec![(1.0, "A".to_string()), (0.5, "B".to_string())];
        let vector = vec![(1.0, "B".to_string())];
        let fused = fuse_rankings(&keyword, &vector, 0.4, 0.6, 10);
        assert_eq!(fused[0], "B");
    }

    #[test]
    fn token_count_is_stable() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("Konsultation 15 Min."), 4);
    }
}
