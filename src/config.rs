//! Configuration loading.
//!
//! Static settings live in `config.ini`; environment variables override the
//! provider endpoints and stage models. Model capability flags learned at
//! runtime are persisted separately in `config.runtime.json` so the static
//! file (and its comments) never gets rewritten.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TarifError};

/// How a provider is spoken to on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Any OpenAI-compatible chat-completions endpoint.
    OpenAiCompatible,
    /// Google Gemini `generateContent` REST shape.
    Gemini,
    /// Local Ollama; OpenAI-compatible shape, but calls are serialised.
    Ollama,
}

impl ProviderKind {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "gemini" => ProviderKind::Gemini,
            "ollama" => ProviderKind::Ollama,
            _ => ProviderKind::OpenAiCompatible,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub provider: String,
    pub model: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub runtime_path: PathBuf,
    pub feedback_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub stage1: StageSettings,
    pub stage2: StageSettings,
    pub providers: HashMap<String, ProviderSettings>,
    pub min_call_interval_seconds: u64,
    pub kumulation_explizit: bool,
    pub use_icd_default: bool,
    pub strict_conditions: bool,
    pub context_limit: usize,
    pub keyword_weight: f64,
    pub vector_weight: f64,
}

fn default_base_url(name: &str) -> String {
    match ProviderKind::from_name(name) {
        ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta".into(),
        ProviderKind::Ollama => "http://localhost:11434/v1".into(),
        ProviderKind::OpenAiCompatible => "https://api.openai.com/v1".into(),
    }
}

type IniSections = HashMap<String, HashMap<String, String>>;

fn section_value<'a>(sections: &'a IniSections, section: &str, key: &str) -> Option<&'a str> {
    sections
        .get(section)
        .and_then(|s| s.get(key))
        .map(String::as_str)
}

fn parse_or_default<T: std::str::FromStr>(value: Option<&str>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value.map(str::trim) {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

impl Settings {
    /// Loads `config.ini` (missing file falls back to defaults) and applies
    /// the environment overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();
        if config_path.is_file() {
            builder = builder.add_source(
                config::File::from(config_path.to_path_buf()).format(config::FileFormat::Ini),
            );
        }
        let raw = builder
            .build()
            .map_err(|e| TarifError::Config(e.to_string()))?;
        let sections: IniSections = raw
            .try_deserialize()
            .map_err(|e| TarifError::Config(e.to_string()))?;

        let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let data_dir = section_value(&sections, "data", "dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("data"));
        let runtime_path = section_value(&sections, "data", "runtime_config")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("config.runtime.json"));
        let feedback_path = section_value(&sections, "data", "feedback_store")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("feedback.jsonl"));

        let mut stage1 = StageSettings {
            provider: section_value(&sections, "llm", "stage1_provider")
                .unwrap_or("openai")
                .to_string(),
            model: section_value(&sections, "llm", "stage1_model")
                .unwrap_or("gpt-4o-mini")
                .to_string(),
            timeout_seconds: parse_or_default(
                section_value(&sections, "llm", "stage1_timeout_seconds"),
                60,
            ),
        };
        let mut stage2 = StageSettings {
            provider: section_value(&sections, "llm", "stage2_provider")
                .unwrap_or(&stage1.provider)
                .to_string(),
            model: section_value(&sections, "llm", "stage2_model")
                .unwrap_or(&stage1.model)
                .to_string(),
            timeout_seconds: parse_or_default(
                section_value(&sections, "llm", "stage2_timeout_seconds"),
                45,
            ),
        };

        if let Ok(provider) = std::env::var("STAGE1_LLM_PROVIDER") {
            stage1.provider = provider;
        }
        if let Ok(model) = std::env::var("STAGE1_LLM_MODEL") {
            stage1.model = model;
        }
        if let Ok(provider) = std::env::var("STAGE2_LLM_PROVIDER") {
            stage2.provider = provider;
        }
        if let Ok(model) = std::env::var("STAGE2_LLM_MODEL") {
            stage2.model = model;
        }

        // Provider sections are named `provider_<name>`; the environment can
        // override or introduce providers via {NAME}_BASE_URL / {NAME}_API_KEY.
        let mut providers: HashMap<String, ProviderSettings> = HashMap::new();
        for (section, values) in &sections {
            if let Some(name) = section.strip_prefix("provider_") {
                providers.insert(
                    name.to_string(),
                    ProviderSettings {
                        name: name.to_string(),
                        kind: ProviderKind::from_name(name),
                        base_url: values
                            .get("base_url")
                            .cloned()
                            .unwrap_or_else(|| default_base_url(name)),
                        api_key: values.get("api_key").cloned().filter(|v| !v.is_empty()),
                    },
                );
            }
        }
        for name in [stage1.provider.clone(), stage2.provider.clone()] {
            providers.entry(name.clone()).or_insert_with(|| ProviderSettings {
                name: name.clone(),
                kind: ProviderKind::from_name(&name),
                base_url: default_base_url(&name),
                api_key: None,
            });
        }
        for provider in providers.values_mut() {
            let env_prefix = provider.name.to_uppercase();
            if let Ok(url) = std::env::var(format!("{env_prefix}_BASE_URL")) {
                provider.base_url = url;
            }
            if let Ok(key) = std::env::var(format!("{env_prefix}_API_KEY")) {
                if !key.is_empty() {
                    provider.api_key = Some(key);
                }
            }
        }

        Ok(Self {
            data_dir,
            runtime_path,
            feedback_path,
            host: section_value(&sections, "server", "host")
                .unwrap_or("127.0.0.1")
                .to_string(),
            port: parse_or_default(section_value(&sections, "server", "port"), 8087),
            stage1,
            stage2,
            providers,
            min_call_interval_seconds: parse_or_default(
                section_value(&sections, "llm", "min_call_interval_seconds"),
                0,
            )
            .min(1000),
            kumulation_explizit: parse_flag(
                section_value(&sections, "regelpruefung", "kumulation_explizit"),
                false,
            ),
            use_icd_default: parse_flag(section_value(&sections, "engine", "use_icd"), true),
            strict_conditions: parse_flag(
                section_value(&sections, "engine", "strict_conditions"),
                false,
            ),
            context_limit: parse_or_default(
                section_value(&sections, "retrieval", "context_limit"),
                crate::retrieval::DEFAULT_CONTEXT_LIMIT,
            ),
            keyword_weight: parse_or_default(
                section_value(&sections, "retrieval", "keyword_weight"),
                1.0,
            ),
            vector_weight: parse_or_default(
                section_value(&sections, "retrieval", "vector_weight"),
                0.5,
            ),
        })
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }
}

/// Capability flags for one model, learned from parameter-rejection errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_temperature: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_max_tokens_named_new: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_response_format: Option<bool>,
}

/// Process-wide capability cache persisted to `config.runtime.json` behind a
/// writer lock. Reads are frequent (every LLM call), writes rare.
pub struct CapabilityStore {
    path: PathBuf,
    inner: RwLock<HashMap<String, ModelCapabilities>>,
}

impl CapabilityStore {
    pub fn load(path: PathBuf) -> Self {
        let inner = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            inner: RwLock::new(inner),
        }
    }

    pub fn get(&self, model: &str) -> ModelCapabilities {
        self.inner
            .read()
            .expect("capability store poisoned")
            .get(model)
            .cloned()
            .unwrap_or_default()
    }

    /// Applies an update and persists the whole map. Persistence failures are
    /// logged, not fatal: the in-memory flag still prevents repeat retries.
    pub fn update(&self, model: &str, apply: impl FnOnce(&mut ModelCapabilities)) {
        let snapshot = {
            let mut guard = self.inner.write().expect("capability store poisoned");
            apply(guard.entry(model.to_string()).or_default());
            guard.clone()
        };
        match serde_json::to_string_pretty(&snapshot) {
            Ok(serialized) => {
                if let Err(err) = std::fs::write(&self.path, serialized) {
                    warn!(path = %self.path.display(), %err, "could not persist capability flags");
                }
            }
            Err(err) => warn!(%err, "could not serialise capability flags"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_config_file() {
        let settings = Settings::load(Path::new("/nonexistent/config.ini")).unwrap();
        assert_eq!(settings.stage1.timeout_seconds, 60);
        assert_eq!(settings.stage2.timeout_seconds, 45);
        assert!(!settings.kumulation_explizit);
        assert!(settings.use_icd_default);
        assert_eq!(settings.context_limit, 200);
        assert!(settings.providers.contains_key("openai"));
    }

    #[test]
    fn ini_values_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(
            &path,
            "[llm]\nstage1_provider = gemini\nstage1_model = gemini-1.5-flash\nmin_call_interval_seconds = 3\n\n[regelpruefung]\nkumulation_explizit = 1\n\n[provider_gemini]\napi_key = test-key\n",
        )
        .unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.stage1.provider, "gemini");
        assert_eq!(settings.min_call_interval_seconds, 3);
        assert!(settings.kumulation_explizit);
        let gemini = settings.provider("gemini").unwrap();
        assert_eq!(gemini.kind, ProviderKind::Gemini);
        assert_eq!(gemini.api_key.as_deref(), Some("test-key"));
    }

    #[test]
    fn capability_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.runtime.json");
        let store = CapabilityStore::load(path.clone());
        assert!(store.get("gpt-5-nano").supports_temperature.is_none());

        store.update("gpt-5-nano", |caps| {
            caps.supports_temperature = Some(false);
        });
        let reloaded = CapabilityStore::load(path);
        assert_eq!(reloaded.get("gpt-5-nano").supports_temperature, Some(false));
    }
}
