use thiserror::Error;

/// Crate-wide error type.
///
/// Rule violations are deliberately *not* represented here: they are data
/// (collected per item in the rule results), never failures of the request.
#[derive(Debug, Error)]
pub enum TarifError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("catalogue data error: {0}")]
    Catalog(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("LLM provider {provider} returned HTTP {status}: {message}")]
    LlmApi {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("LLM provider {provider} unreachable or timed out")]
    LlmTransport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("stage {stage} response could not be parsed: {message}")]
    StageParse { stage: &'static str, message: String },

    #[error("HTTP client initialization failed")]
    HttpClientInit(#[source] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl TarifError {
    /// HTTP status the thin API adapter should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            TarifError::InvalidInput(_) => 400,
            TarifError::StageParse { .. } => 400,
            TarifError::LlmTransport { .. } => 504,
            TarifError::LlmApi { status, .. } if *status == 429 => 429,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, TarifError>;
