//! Provider-agnostic chat-completion gateway.
//!
//! One entry point, `chat`, talking to any OpenAI-compatible endpoint, to
//! Gemini's `generateContent` REST shape, or to a local Ollama (serialised
//! end-to-end). The gateway enforces the process-wide minimum inter-call
//! interval and learns per-model parameter capabilities from 400 responses:
//! the offending parameter is dropped or renamed, the flag persisted, and
//! the request retried once without further throttling. 5xx and transport
//! errors are never retried.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CapabilityStore, ProviderKind, ProviderSettings, Settings};
use crate::error::{Result, TarifError};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Request a JSON object response where the provider supports it.
    pub json_response: bool,
    pub timeout: Option<Duration>,
}

pub struct LlmGateway {
    client: reqwest::Client,
    capabilities: Arc<CapabilityStore>,
    min_interval: Duration,
    /// Monotonic timestamp of the last call, guarded by the throttle mutex.
    /// Holding the lock through the sleep serialises concurrent waiters.
    throttle: Mutex<Option<Instant>>,
    /// Local Ollama cannot handle concurrent generations; one at a time.
    ollama_serial: Mutex<()>,
}

impl LlmGateway {
    pub fn new(settings: &Settings, capabilities: Arc<CapabilityStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tarifdoc/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(TarifError::HttpClientInit)?;
        Ok(Self {
            client,
            capabilities,
            min_interval: Duration::from_secs(settings.min_call_interval_seconds),
            throttle: Mutex::new(None),
            ollama_serial: Mutex::new(()),
        })
    }

    /// Sends a chat request and returns the assistant content as a string.
    /// JSON parsing is the caller's responsibility.
    pub async fn chat(
        &self,
        provider: &ProviderSettings,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String> {
        self.enforce_min_interval().await;

        let _serial = match provider.kind {
            ProviderKind::Ollama => Some(self.ollama_serial.lock().await),
            _ => None,
        };

        match provider.kind {
            ProviderKind::Gemini => self.chat_gemini(provider, model, messages, options).await,
            _ => self.chat_openai(provider, model, messages, options).await,
        }
    }

    async fn enforce_min_interval(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.throttle.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                info!(wait_ms = wait.as_millis() as u64, "throttling LLM call");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn chat_openai(
        &self,
        provider: &ProviderSettings,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            provider.base_url.trim_end_matches('/')
        );
        let timeout = options.timeout.unwrap_or(Duration::from_secs(60));
        let mut adjusted: HashSet<&'static str> = HashSet::new();

        loop {
            let capabilities = self.capabilities.get(model);
            let mut body = json!({
                "model": model,
                "messages": messages,
            });
            if let Some(temperature) = options.temperature {
                if capabilities.supports_temperature != Some(false) {
                    body["temperature"] = json!(temperature);
                }
            }
            if let Some(max_tokens) = options.max_tokens {
                if capabilities.supports_max_tokens_named_new == Some(true) {
                    body["max_completion_tokens"] = json!(max_tokens);
                } else {
                    body["max_tokens"] = json!(max_tokens);
                }
            }
            if options.json_response && capabilities.supports_response_format != Some(false) {
                body["response_format"] = json!({"type": "json_object"});
            }

            let mut request = self.client.post(&url).timeout(timeout).json(&body);
            if let Some(key) = &provider.api_key {
                request = request.bearer_auth(key);
            }
            let response = request.send().await.map_err(|source| TarifError::LlmTransport {
                provider: provider.name.clone(),
                source,
            })?;
            let status = response.status();
            let payload: Value = response.json().await.unwrap_or(Value::Null);

            if status.is_success() {
                return extract_openai_content(&payload).ok_or_else(|| TarifError::LlmApi {
                    provider: provider.name.clone(),
                    status: status.as_u16(),
                    message: "response carried no assistant content".into(),
                });
            }

            if status.as_u16() == 400 {
                if let Some(param) = unsupported_parameter(&payload) {
                    if adjusted.insert(param) {
                        warn!(
                            model,
                            param, "model rejected parameter, persisting capability and retrying"
                        );
                        self.persist_capability(model, param);
                        continue;
                    }
                }
            }

            return Err(TarifError::LlmApi {
                provider: provider.name.clone(),
                status: status.as_u16(),
                message: error_message(&payload),
            });
        }
    }

    fn persist_capability(&self, model: &str, param: &str) {
        match param {
            "temperature" => self.capabilities.update(model, |caps| {
                caps.supports_temperature = Some(false);
            }),
            "max_tokens" => self.capabilities.update(model, |caps| {
                caps.supports_max_tokens_named_new = Some(true);
            }),
            "response_format" => self.capabilities.update(model, |caps| {
                caps.supports_response_format = Some(false);
            }),
            _ => {}
        }
    }

    async fn chat_gemini(
        &self,
        provider: &ProviderSettings,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String> {
        let key = provider.api_key.as_deref().unwrap_or("");
        let url = format!(
            "{}/models/{model}:generateContent?key={key}",
            provider.base_url.trim_end_matches('/')
        );
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut generation_config = json!({});
        if let Some(temperature) = options.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        if options.json_response {
            generation_config["response_mime_type"] = json!("application/json");
        }
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": generation_config,
        });

        let timeout = options.timeout.unwrap_or(Duration::from_secs(60));
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|source| TarifError::LlmTransport {
                provider: provider.name.clone(),
                source,
            })?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(TarifError::LlmApi {
                provider: provider.name.clone(),
                status: status.as_u16(),
                message: error_message(&payload),
            });
        }

        extract_gemini_content(&payload).ok_or_else(|| {
            let block_reason = payload
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            debug!(block_reason, "gemini returned no candidates");
            TarifError::LlmApi {
                provider: provider.name.clone(),
                status: status.as_u16(),
                message: format!("no candidates in response (blockReason: {block_reason})"),
            }
        })
    }
}

fn extract_openai_content(payload: &Value) -> Option<String> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_gemini_content(payload: &Value) -> Option<String> {
    payload
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// Detects the typical unsupported-parameter 400 of OpenAI-compatible APIs:
/// `{"error": {"code": "unsupported_value", "param": "temperature", ...}}`.
fn unsupported_parameter(payload: &Value) -> Option<&'static str> {
    let error = payload.get("error")?;
    let code = error.get("code").and_then(Value::as_str).unwrap_or("");
    let param = error.get("param").and_then(Value::as_str).unwrap_or("");
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();

    let code_matches = matches!(code, "unsupported_value" | "invalid_request_error");
    for candidate in ["temperature", "max_tokens", "response_format"] {
        if code_matches && param == candidate {
            return Some(candidate);
        }
        if message.contains(candidate)
            && (message.contains("unsupported") || message.contains("only the default"))
        {
            return Some(candidate);
        }
    }
    None
}

fn error_message(payload: &Value) -> String {
    payload
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}
