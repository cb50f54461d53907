//! Thin HTTP adapter over the engine.
//!
//! Routes map 1:1 onto engine operations; no billing logic lives here. The
//! UI assets are served elsewhere.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::catalog::types::Language;
use crate::engine::{AnalyzeRequest, Engine};
use crate::error::TarifError;

const EXAMPLES_FILE: &str = "baseline_examples.json";

/// One baseline example for `/api/test-example`.
#[derive(Debug, Clone, Deserialize)]
pub struct BaselineExample {
    pub id: i64,
    pub text_de: Option<String>,
    pub text_fr: Option<String>,
    pub text_it: Option<String>,
    #[serde(default)]
    pub expected_type: String,
    #[serde(default)]
    pub expected_pauschale: Option<String>,
    #[serde(default)]
    pub expected_lkns: Vec<String>,
}

impl BaselineExample {
    fn text_in(&self, lang: Language) -> Option<&str> {
        let preferred = match lang {
            Language::De => self.text_de.as_deref(),
            Language::Fr => self.text_fr.as_deref(),
            Language::It => self.text_it.as_deref(),
        };
        preferred.or(self.text_de.as_deref())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub examples: Arc<Vec<BaselineExample>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let examples = load_examples(&engine.settings.data_dir);
        Self {
            engine,
            examples: Arc::new(examples),
        }
    }
}

fn load_examples(data_dir: &Path) -> Vec<BaselineExample> {
    let path = data_dir.join(EXAMPLES_FILE);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/analyze-billing", post(analyze_billing))
        .route("/api/test-example", post(test_example))
        .route("/api/icd", get(icd_search))
        .route("/api/chop", get(chop_search))
        .route("/api/version", get(version))
        .route("/api/submit-feedback", post(submit_feedback))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

struct ApiError(TarifError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(err = %self.0, "request failed");
        }
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

async fn analyze_billing(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<crate::engine::AnalyzeResponse>, ApiError> {
    let response = state.engine.analyze(request).await.map_err(ApiError)?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct TestExampleRequest {
    id: i64,
    #[serde(default)]
    lang: Option<String>,
}

#[derive(Debug, Serialize)]
struct TestExampleResponse {
    passed: bool,
    diff: Vec<String>,
    result: crate::engine::AnalyzeResponse,
}

async fn test_example(
    State(state): State<AppState>,
    Json(request): Json<TestExampleRequest>,
) -> Result<Json<TestExampleResponse>, ApiError> {
    let lang = Language::parse(request.lang.as_deref().unwrap_or("de"));
    let example = state
        .examples
        .iter()
        .find(|e| e.id == request.id)
        .ok_or_else(|| {
            ApiError(TarifError::InvalidInput(format!(
                "unknown example id {}",
                request.id
            )))
        })?;
    let text = example.text_in(lang).ok_or_else(|| {
        ApiError(TarifError::InvalidInput(format!(
            "example {} has no text for {}",
            example.id,
            lang.as_str()
        )))
    })?;

    let result = state
        .engine
        .analyze(AnalyzeRequest {
            input_text: text.to_string(),
            lang: Some(lang.as_str().to_string()),
            ..Default::default()
        })
        .await
        .map_err(ApiError)?;

    let mut diff: Vec<String> = Vec::new();
    let abrechnung = serde_json::to_value(&result.abrechnung).unwrap_or(Value::Null);
    let actual_type = abrechnung["type"].as_str().unwrap_or("");
    if !example.expected_type.is_empty() && actual_type != example.expected_type {
        diff.push(format!(
            "type: expected {}, got {actual_type}",
            example.expected_type
        ));
    }
    if let Some(expected) = &example.expected_pauschale {
        let actual = abrechnung["details"]["Pauschale"].as_str().unwrap_or("");
        if actual != expected {
            diff.push(format!("pauschale: expected {expected}, got {actual}"));
        }
    }
    if !example.expected_lkns.is_empty() {
        let actual: Vec<String> = abrechnung["leistungen"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i["lkn"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        for expected in &example.expected_lkns {
            if !actual.contains(expected) {
                diff.push(format!("missing LKN {expected}"));
            }
        }
    }

    Ok(Json(TestExampleResponse {
        passed: diff.is_empty(),
        diff,
        result,
    }))
}

async fn icd_search(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let query = params.get("q").map(String::as_str).unwrap_or("");
    let lang = Language::parse(params.get("lang").map(String::as_str).unwrap_or("de"));
    let hits = state.engine.store.search_icd(query, lang, 50);
    Json(json!(hits))
}

async fn chop_search(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let query = params.get("q").map(String::as_str).unwrap_or("");
    let lang = Language::parse(params.get("lang").map(String::as_str).unwrap_or("de"));
    let hits = state.engine.store.search_chop(query, lang, 50);
    Json(json!(hits))
}

async fn version(State(state): State<AppState>) -> Json<Value> {
    let mut body = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "tarif_version": state.engine.tariff_version(),
    });
    if let Some(size) = state.engine.embedding_index_size() {
        body["embedding_index_entries"] = json!(size);
    }
    Json(body)
}

async fn submit_feedback(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let record = json!({
        "received_at": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        "feedback": payload,
    });
    let path = &state.engine.settings.feedback_path;
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{record}"));
    match result {
        Ok(()) => Ok(Json(json!({"status": "stored"}))),
        Err(err) => Err(ApiError(TarifError::Io(err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use tower::ServiceExt;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let entries: Vec<crate::catalog::CatalogEntry> = Vec::new();
        let tables: Vec<crate::catalog::TableRow> = vec![
            serde_json::from_value(serde_json::json!({
                "Tabelle": "icd_haupt", "Tabelle_Typ": "icd",
                "Code": "S03.0", "Code_Text": "Luxation des Kiefers"
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "Tabelle": "chop_haupt", "Tabelle_Typ": "tariff",
                "Code": "77.91", "Code_Text": "Knochenentnahme"
            }))
            .unwrap(),
        ];
        let store = crate::catalog::CatalogStore::new(
            entries,
            Vec::new(),
            tables,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            "TARDOC 1.4".into(),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut settings =
            Settings::load(std::path::Path::new("/nonexistent/config.ini")).unwrap();
        settings.runtime_path = dir.path().join("config.runtime.json");
        settings.feedback_path = dir.path().join("feedback.jsonl");
        let engine = Engine::from_parts(settings, store, None).unwrap();
        let state = AppState {
            engine: Arc::new(engine),
            examples: Arc::new(Vec::new()),
        };
        (state, dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn version_reports_catalogue_version() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/version")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["tarif_version"], "TARDOC 1.4");
    }

    #[tokio::test]
    async fn icd_search_matches_code_and_text() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/icd?q=luxation&lang=de")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body[0]["Code"], "S03.0");
    }

    #[tokio::test]
    async fn chop_search_uses_tariff_tables() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/chop?q=77.91")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body[0]["Code"], "77.91");
    }

    #[tokio::test]
    async fn missing_input_text_is_a_400() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/analyze-billing")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"inputText": "  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("inputText"));
    }

    #[tokio::test]
    async fn unknown_test_example_is_a_400() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/test-example")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"id": 99}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn feedback_appends_to_store() {
        let (state, _dir) = test_state();
        let path = state.engine.settings.feedback_path.clone();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/submit-feedback")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"rating": "good"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored = std::fs::read_to_string(path).unwrap();
        assert!(stored.contains("\"rating\":\"good\""));
    }
}
