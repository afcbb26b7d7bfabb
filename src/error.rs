//! Typed errors for each pipeline stage.

use thiserror::Error;

/// Listing page could not be retrieved.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page {page} failed after {attempts} attempt(s): {reason}")]
    Network {
        page: u32,
        attempts: u32,
        reason: String,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Errors from the completion endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),
    #[error("HTTP status {code}: {body}")]
    HttpStatus { code: u16, body: String },
    #[error("JSON parse error in {context}: {source}")]
    JsonParse {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("empty response: no choices returned")]
    EmptyResponse,
    #[error("client initialization failed: {0}")]
    ClientInit(String),
    #[error("all retries exhausted, last error: {0}")]
    RetriesExhausted(Box<LlmError>),
}

impl LlmError {
    /// Whether this error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpRequest(_) => true,
            Self::HttpStatus { code, .. } => matches!(code, 408 | 429 | 500 | 502 | 503 | 504 | 529),
            _ => false,
        }
    }
}

/// Completion response did not match the record schema.
///
/// Every violation found in one response is reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("response did not match schema: {}", violations.join("; "))]
pub struct SchemaError {
    pub violations: Vec<String>,
}

impl SchemaError {
    pub fn single(violation: impl Into<String>) -> Self {
        Self {
            violations: vec![violation.into()],
        }
    }
}

/// Why a single extraction fell back to a partial record.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("item block has no text")]
    EmptyInput,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violated for rank {rank}: {message}")]
    Constraint { rank: u32, message: String },
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode list column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Classify a failed write, separating per-record rejections from other failures
    pub(crate) fn from_write(rank: u32, err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint {
                    rank,
                    message: message.unwrap_or_else(|| code.to_string()),
                }
            }
            // A value the column cannot hold, e.g. an integer past i64::MAX
            rusqlite::Error::ToSqlConversionFailure(e) => StoreError::Constraint {
                rank,
                message: format!("value out of range: {}", e),
            },
            other => StoreError::Sqlite(other),
        }
    }
}

/// Fatal configuration problems, reported before any network activity.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DEEPSEEK_API_KEY must be set (or api_key in the config file) unless --skip-ai is given")]
    MissingApiKey,
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid setting {key}: {message}")]
    Invalid { key: &'static str, message: String },
}
