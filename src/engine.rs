//! Request orchestration: retrieval → Stage-1 → rule engine → (Stage-2 →
//! condition evaluation → selection) or TARDOC assembly.
//!
//! The engine is an immutable value constructed once at startup; request
//! handlers share it behind an `Arc`. All request-scoped state (table cache,
//! candidate set, token counters) lives on the stack of `analyze`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::billing::{
    prepare_tardoc_billing, Abrechnung, PauschaleDetails, RuleCheckSummary, RuleResultDetail,
};
use crate::catalog::load::load_catalog;
use crate::catalog::types::Language;
use crate::catalog::{normalize_code, CatalogStore, TableCache};
use crate::config::{CapabilityStore, Settings};
use crate::context::BillingContext;
use crate::demographics::extract_patient_demographics;
use crate::error::{Result, TarifError};
use crate::i18n::{translate_fmt, translate_rule_message};
use crate::llm::stage1::{parse_stage1_response, validate_against_catalog, Stage1Output};
use crate::llm::{stage2, ChatMessage, ChatOptions, IdentifiedService, LlmGateway};
use crate::pauschale::{collect_candidates, determine_applicable_package, Selection, StructureIndex};
use crate::retrieval::{
    build_context_window, compute_token_doc_freq, count_tokens, extract_keywords, EmbeddingIndex,
};
use crate::rules::{check_billability, BillingCase};

/// Body of `/api/analyze-billing`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub input_text: String,
    #[serde(default)]
    pub icd: Vec<String>,
    #[serde(default)]
    pub gtin: Vec<String>,
    #[serde(default)]
    pub age: Option<i64>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub use_icd: Option<bool>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub laterality: Option<String>,
    #[serde(default)]
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTokens {
    pub calls: usize,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl StageTokens {
    fn record(&mut self, prompt: &str, completion: &str) {
        self.calls += 1;
        self.prompt_tokens += count_tokens(prompt);
        self.completion_tokens += count_tokens(completion);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenUsage {
    pub stage1: StageTokens,
    pub stage2_mapping: StageTokens,
    pub stage2_ranking: StageTokens,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingResult {
    pub tardoc_lkn: String,
    pub tardoc_desc: String,
    pub mapped_lkn: Option<String>,
    pub candidates_considered_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stage2Summary {
    pub mapping_results: Vec<MappingResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ranking: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub llm_ergebnis_stufe1: Stage1Output,
    pub regel_ergebnisse_details: Vec<RuleResultDetail>,
    pub abrechnung: Abrechnung,
    pub llm_ergebnis_stufe2: Stage2Summary,
    pub token_usage: TokenUsage,
}

pub struct Engine {
    pub settings: Settings,
    pub store: CatalogStore,
    doc_freq: std::collections::HashMap<String, usize>,
    embeddings: Option<EmbeddingIndex>,
    structure_index: StructureIndex,
    gateway: LlmGateway,
}

impl Engine {
    /// Boots the engine from the settings: catalogue, document frequencies,
    /// capability flags, gateway.
    pub fn new(settings: Settings) -> Result<Self> {
        let (store, embeddings) = load_catalog(&settings.data_dir)?;
        Self::from_parts(settings, store, embeddings)
    }

    pub fn from_parts(
        settings: Settings,
        store: CatalogStore,
        embeddings: Option<EmbeddingIndex>,
    ) -> Result<Self> {
        let capabilities = Arc::new(CapabilityStore::load(settings.runtime_path.clone()));
        let gateway = LlmGateway::new(&settings, capabilities)?;
        let doc_freq = compute_token_doc_freq(&store);
        Ok(Self {
            settings,
            store,
            doc_freq,
            embeddings,
            structure_index: StructureIndex::new(),
            gateway,
        })
    }

    pub fn tariff_version(&self) -> &str {
        self.store.tariff_version()
    }

    /// Size of the loaded embedding index, when one shipped with the data.
    pub fn embedding_index_size(&self) -> Option<usize> {
        self.embeddings.as_ref().map(EmbeddingIndex::len)
    }

    /// Synonym variants for the Stage-1 prompt, from the synonym catalogue.
    fn synonym_variants(&self, user_text: &str) -> Vec<String> {
        let mut variants: Vec<String> = Vec::new();
        for token in extract_keywords(user_text) {
            if let Some(expansion) = self.store.synonyms_for(&token) {
                if !variants.contains(&token) {
                    variants.push(token.clone());
                }
                for variant in expansion {
                    if !variants.contains(variant) {
                        variants.push(variant.clone());
                    }
                }
            }
        }
        variants.sort();
        variants
    }

    async fn run_stage1(
        &self,
        user_text: &str,
        lang: Language,
        usage: &mut TokenUsage,
    ) -> Result<Stage1Output> {
        let (_, katalog_context) = build_context_window(
            user_text,
            lang,
            &self.store,
            &self.doc_freq,
            // The description index is pre-built offline; without a query-side
            // embedder only the keyword ranking contributes.
            None,
            (self.settings.keyword_weight, self.settings.vector_weight),
            self.settings.context_limit,
        );
        if katalog_context.is_empty() && self.store.entry_count() == 0 {
            return Err(TarifError::Catalog("service catalogue is empty".into()));
        }

        let synonyms = self.synonym_variants(user_text);
        let prompt =
            crate::llm::prompts::stage1_prompt(user_text, &katalog_context, lang, &synonyms)?;
        let provider = self
            .settings
            .provider(&self.settings.stage1.provider)
            .ok_or_else(|| {
                TarifError::Config(format!(
                    "stage-1 provider '{}' is not configured",
                    self.settings.stage1.provider
                ))
            })?;
        let content = self
            .gateway
            .chat(
                provider,
                &self.settings.stage1.model,
                &[ChatMessage::user(prompt.clone())],
                &ChatOptions {
                    temperature: Some(0.05),
                    max_tokens: Some(2048),
                    json_response: true,
                    timeout: Some(Duration::from_secs(self.settings.stage1.timeout_seconds)),
                },
            )
            .await?;
        usage.stage1.record(&prompt, &content);

        let parsed = parse_stage1_response(&content)?;
        Ok(validate_against_catalog(parsed, user_text, lang, &self.store))
    }

    /// Builds the per-item rule results; the only recovery is reducing an
    /// over-cap quantity when the quantity rule is the sole violation.
    pub fn check_rules(
        &self,
        services: &[IdentifiedService],
        context: &BillingContext,
    ) -> (Vec<RuleResultDetail>, Vec<IdentifiedService>) {
        let mut details: Vec<RuleResultDetail> = Vec::new();
        let mut passing: Vec<IdentifiedService> = Vec::new();

        for service in services {
            let companions: Vec<String> = services
                .iter()
                .filter(|other| other.lkn != service.lkn)
                .map(|other| other.lkn.clone())
                .collect();
            let companion_types = services
                .iter()
                .filter(|other| other.lkn != service.lkn)
                .map(|other| (other.lkn.clone(), other.typ.clone()))
                .collect();
            let case = BillingCase {
                lkn: service.lkn.clone(),
                typ: Some(service.typ.clone()),
                quantity: service.menge,
                companions,
                companion_types,
                age: context.age,
                gender: context.gender.clone(),
                medications: context.medications.clone(),
                icd_codes: context.icd_codes.clone(),
                active_pauschalen: Vec::new(),
            }
            .normalized();
            let check = check_billability(&case, &self.store, self.settings.kumulation_explizit);

            let mut billable = check.billable;
            let mut final_menge = if billable { service.menge } else { 0 };
            let mut quantity_reduced = false;
            let mut errors: Vec<String> =
                check.violations.iter().map(|v| v.message.clone()).collect();

            if !billable {
                if let Some(cap) = check.only_quantity_violations() {
                    if cap > 0 && service.menge > cap {
                        billable = true;
                        final_menge = cap;
                        quantity_reduced = true;
                        errors = vec![translate_fmt(
                            "rule_qty_reduced",
                            Language::De,
                            &[("value", &cap.to_string())],
                        )];
                        info!(lkn = %service.lkn, cap, "quantity reduced to rule cap");
                    }
                }
            }

            details.push(RuleResultDetail {
                lkn: Some(service.lkn.clone()),
                initiale_menge: service.menge,
                regelpruefung: RuleCheckSummary {
                    abrechnungsfaehig: billable,
                    fehler: errors,
                },
                finale_menge: final_menge,
                quantity_reduced,
            });
            if billable && final_menge > 0 {
                let mut kept = service.clone();
                kept.menge = final_menge;
                passing.push(kept);
            }
        }

        (details, passing)
    }

    async fn run_stage2_mapping(
        &self,
        user_context: &BillingContext,
        passing: &[IdentifiedService],
        candidates: &BTreeSet<String>,
        cache: &mut TableCache,
        usage: &mut TokenUsage,
        summary: &mut Stage2Summary,
    ) -> Result<Vec<String>> {
        let to_map: Vec<&IdentifiedService> = passing
            .iter()
            .filter(|s| s.typ == "E" || s.typ == "EZ")
            .collect();
        if to_map.is_empty() {
            return Ok(Vec::new());
        }
        let condition_lkns = stage2::collect_condition_lkns(
            candidates,
            &self.store,
            &self.structure_index,
            cache,
            user_context.lang,
        );
        if condition_lkns.is_empty() {
            return Ok(Vec::new());
        }

        let provider = self
            .settings
            .provider(&self.settings.stage2.provider)
            .ok_or_else(|| {
                TarifError::Config(format!(
                    "stage-2 provider '{}' is not configured",
                    self.settings.stage2.provider
                ))
            })?;

        let mut mapped: Vec<String> = Vec::new();
        for service in to_map {
            let narrowed =
                stage2::narrow_candidates(&service.lkn, &condition_lkns, &self.store, cache);
            if narrowed.is_empty() {
                summary.mapping_results.push(MappingResult {
                    tardoc_lkn: service.lkn.clone(),
                    tardoc_desc: service.beschreibung.clone(),
                    mapped_lkn: None,
                    candidates_considered_count: 0,
                    error: None,
                });
                continue;
            }
            let prompt =
                crate::llm::prompts::mapping_prompt(&service.lkn, &service.beschreibung, &narrowed)?;
            let outcome = self
                .gateway
                .chat(
                    provider,
                    &self.settings.stage2.model,
                    &[ChatMessage::user(prompt.clone())],
                    &ChatOptions {
                        temperature: Some(0.05),
                        max_tokens: Some(4096),
                        json_response: false,
                        timeout: Some(Duration::from_secs(self.settings.stage2.timeout_seconds)),
                    },
                )
                .await;
            match outcome {
                Ok(content) => {
                    usage.stage2_mapping.record(&prompt, &content);
                    let selection = stage2::select_mapped_code(&content, &narrowed);
                    if let Some(code) = &selection {
                        mapped.push(code.clone());
                    }
                    summary.mapping_results.push(MappingResult {
                        tardoc_lkn: service.lkn.clone(),
                        tardoc_desc: service.beschreibung.clone(),
                        mapped_lkn: selection,
                        candidates_considered_count: narrowed.len(),
                        error: None,
                    });
                }
                Err(err @ TarifError::LlmTransport { .. }) => return Err(err),
                Err(err) => {
                    warn!(lkn = %service.lkn, %err, "stage-2 mapping failed, continuing");
                    summary.mapping_results.push(MappingResult {
                        tardoc_lkn: service.lkn.clone(),
                        tardoc_desc: service.beschreibung.clone(),
                        mapped_lkn: None,
                        candidates_considered_count: narrowed.len(),
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(mapped)
    }

    async fn run_stage2_ranking(
        &self,
        user_text: &str,
        candidates: &BTreeSet<String>,
        lang: Language,
        usage: &mut TokenUsage,
    ) -> Vec<String> {
        if candidates.len() < 2 {
            return Vec::new();
        }
        let shortlist: Vec<(String, String)> = candidates
            .iter()
            .map(|code| {
                let text = self
                    .store
                    .pauschale(code)
                    .and_then(|d| d.text_in(lang))
                    .unwrap_or_default()
                    .to_string();
                (code.clone(), text)
            })
            .collect();
        let Ok(prompt) = crate::llm::prompts::ranking_prompt(user_text, &shortlist) else {
            return Vec::new();
        };
        let Some(provider) = self.settings.provider(&self.settings.stage2.provider) else {
            return Vec::new();
        };
        match self
            .gateway
            .chat(
                provider,
                &self.settings.stage2.model,
                &[ChatMessage::user(prompt.clone())],
                &ChatOptions {
                    temperature: Some(0.1),
                    max_tokens: Some(500),
                    json_response: false,
                    timeout: Some(Duration::from_secs(self.settings.stage2.timeout_seconds)),
                },
            )
            .await
        {
            Ok(content) => {
                usage.stage2_ranking.record(&prompt, &content);
                let ranked = stage2::parse_ranking_codes(&content);
                ranked
                    .into_iter()
                    .filter(|code| candidates.contains(code))
                    .collect()
            }
            Err(err) => {
                warn!(%err, "stage-2 ranking failed, keeping deterministic order");
                Vec::new()
            }
        }
    }

    /// Full request lifecycle. Rule errors never fail the request; LLM parse
    /// errors and transport failures do.
    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalyzeResponse> {
        let user_text = request.input_text.trim().to_string();
        if user_text.is_empty() {
            return Err(TarifError::InvalidInput("'inputText' is required".into()));
        }
        let lang = Language::parse(request.lang.as_deref().unwrap_or("de"));
        let use_icd = request.use_icd.unwrap_or(self.settings.use_icd_default);

        let mut usage = TokenUsage::default();
        let mut stage2_summary = Stage2Summary::default();
        let mut cache = TableCache::new();

        // Stage 1: identification plus demographics reconciliation.
        let stage1 = self.run_stage1(&user_text, lang, &mut usage).await?;
        let text_demographics = extract_patient_demographics(&user_text);

        let age = request
            .age
            .or(text_demographics.age_value)
            .or(stage1.extracted_info.alter);
        let gender = request
            .gender
            .clone()
            .or_else(|| text_demographics.gender.clone())
            .or_else(|| stage1.extracted_info.geschlecht.clone());
        let laterality = request
            .laterality
            .clone()
            .or_else(|| stage1.extracted_info.seitigkeit.clone())
            .filter(|v| v != "unbekannt");
        let procedure_count = request.count.or(stage1.extracted_info.anzahl_prozeduren);

        let mut context = BillingContext {
            lkn_codes: Vec::new(),
            icd_codes: request.icd.clone(),
            medications: request.gtin.clone(),
            age,
            gender,
            laterality,
            procedure_count,
            use_icd,
            lang,
        }
        .normalized();

        // Rule engine.
        let (mut rule_details, passing) =
            self.check_rules(&stage1.identified_leistungen, &context);
        if stage1.identified_leistungen.is_empty() {
            rule_details.push(RuleResultDetail {
                lkn: None,
                initiale_menge: 0,
                regelpruefung: RuleCheckSummary {
                    abrechnungsfaehig: false,
                    fehler: vec![crate::i18n::translate("llm_no_lkn", Language::De).to_string()],
                },
                finale_menge: 0,
                quantity_reduced: false,
            });
        }

        let abrechnung = self
            .decide(
                &user_text,
                &rule_details,
                &passing,
                &mut context,
                &mut cache,
                &mut usage,
                &mut stage2_summary,
            )
            .await?;

        // Localise rule messages at the response edge.
        for detail in &mut rule_details {
            for message in &mut detail.regelpruefung.fehler {
                *message = translate_rule_message(message, lang);
            }
        }

        info!(abrechnung = abrechnung.type_name(), "analysis finished");
        Ok(AnalyzeResponse {
            llm_ergebnis_stufe1: stage1,
            regel_ergebnisse_details: rule_details,
            abrechnung,
            llm_ergebnis_stufe2: stage2_summary,
            token_usage: usage,
        })
    }

    /// Decision core: package path when possible, TARDOC otherwise.
    #[allow(clippy::too_many_arguments)]
    async fn decide(
        &self,
        user_text: &str,
        rule_details: &[RuleResultDetail],
        passing: &[IdentifiedService],
        context: &mut BillingContext,
        cache: &mut TableCache,
        usage: &mut TokenUsage,
        stage2_summary: &mut Stage2Summary,
    ) -> Result<Abrechnung> {
        let lang = context.lang;
        if passing.is_empty() {
            return Ok(prepare_tardoc_billing(rule_details, &self.store, lang));
        }

        let passing_codes: Vec<String> = passing.iter().map(|s| s.lkn.clone()).collect();
        let has_package_component = passing.iter().any(|s| s.typ == "P" || s.typ == "PZ");
        let has_link = passing_codes
            .iter()
            .any(|code| !self.store.service_links(code).is_empty());
        if !has_package_component && !has_link {
            info!("only individual services identified, skipping package path");
            return Ok(prepare_tardoc_billing(rule_details, &self.store, lang));
        }

        let candidates = collect_candidates(&passing_codes, &self.store, &self.structure_index);
        if candidates.is_empty() {
            return Ok(prepare_tardoc_billing(rule_details, &self.store, lang));
        }

        // Context enrichment: map E/EZ items onto package-condition codes.
        let mapped = self
            .run_stage2_mapping(context, passing, &candidates, cache, usage, stage2_summary)
            .await?;
        let mut lkn_context: Vec<String> = passing_codes.clone();
        for code in mapped {
            let code = normalize_code(&code);
            if !lkn_context.contains(&code) {
                lkn_context.push(code);
            }
        }
        context.lkn_codes = lkn_context;

        let ranking = self
            .run_stage2_ranking(user_text, &candidates, lang, usage)
            .await;
        stage2_summary.ranking = ranking.clone();

        let selection = determine_applicable_package(
            context,
            &candidates,
            &passing_codes,
            &ranking,
            &self.store,
            &self.structure_index,
            cache,
            self.settings.strict_conditions,
        );

        match selection {
            Selection::Selected(selected) => Ok(Abrechnung::Pauschale {
                details: PauschaleDetails {
                    code: selected.code,
                    text: selected.text,
                    tax_points: selected.tax_points,
                    pauschale_erklaerung_html: selected.explanation_html,
                    potential_icds: selected.potential_icds,
                },
                bedingungs_pruef_html: selected.condition_html,
                bedingungs_fehler: selected.condition_errors,
                conditions_met: true,
            }),
            Selection::NoneApplicable { evaluated } => {
                let fallback = prepare_tardoc_billing(rule_details, &self.store, lang);
                match fallback {
                    Abrechnung::Error { .. } => Ok(Abrechnung::Error {
                        message: crate::pauschale::selector::no_applicable_message(lang),
                        evaluated_pauschalen: Some(evaluated),
                    }),
                    other => Ok(other),
                }
            }
            Selection::NoCandidates => {
                Ok(prepare_tardoc_billing(rule_details, &self.store, lang))
            }
        }
    }
}
