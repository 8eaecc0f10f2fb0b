//! Error taxonomy for the reconciliation pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Rate limits, gateway errors and timeouts. Retried with backoff.
    #[error("transient rpc error from {endpoint}: {message}")]
    Transient { endpoint: String, message: String },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Provider refused the block range (too many results / range too wide).
    #[error("log query range too large: {0}")]
    RangeTooLarge(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("data quality: {0}")]
    DataQuality(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("validation failed for {table}: {reason}")]
    Validation { table: String, reason: String },

    /// At least one ingestion worker halted; later stages must not run on a gap.
    #[error("ingestion incomplete: {0}")]
    IngestIncomplete(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    pub fn validation(table: &str, reason: impl Into<String>) -> Self {
        PipelineError::Validation {
            table: table.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether a retry against the same or another endpoint may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Transient { .. } => true,
            PipelineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_failures_are_transient() {
        let t = PipelineError::Transient {
            endpoint: "https://rpc.example".into(),
            message: "429 Too Many Requests".into(),
        };
        assert!(t.is_transient());
        assert!(!PipelineError::Rpc { code: -32602, message: "bad params".into() }.is_transient());
        assert!(!PipelineError::RangeTooLarge("more than 10000 results".into()).is_transient());
        assert!(!PipelineError::validation("trades", "fanout").is_transient());
    }
}
