//! Step-level error types.

use serde_json::Value;
use thiserror::Error;

use crate::model::ErrorCodeDef;
use crate::sandbox::SandboxError;

/// Errors raised while executing a single step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("Template render failed: {0}")]
    TemplateRender(String),
    #[error("Step timed out after {0}ms")]
    Timeout(u64),
    #[error("HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("Rate limit exceeded")]
    RateLimit { retry_after_ms: Option<u64> },
    #[error("Max iterations exceeded: {0}")]
    MaxIterations(u64),
    #[error("Step cancelled")]
    Cancelled,
    #[error("Block not found for step: {0}")]
    BlockNotFound(String),
    #[error("[{code}] {message}")]
    Block {
        code: String,
        message: String,
        retryable: bool,
        details: Option<Value>,
    },
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StepError {
    /// Whether the enclosing retry policy may re-attempt the step.
    pub fn retryable(&self) -> bool {
        match self {
            StepError::Timeout(_) => true,
            StepError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            StepError::RateLimit { .. } => true,
            StepError::Block { retryable, .. } => *retryable,
            StepError::Sandbox(SandboxError::Timeout(_)) => true,
            _ => false,
        }
    }

    /// Classify a message thrown from block code against the block's declared
    /// error codes. Messages follow the `[CODE] text` convention; unknown or
    /// unprefixed messages map to a non-retryable execution error.
    pub fn classify_thrown(message: &str, error_codes: &[ErrorCodeDef]) -> StepError {
        if let Some((code, rest)) = parse_code_prefix(message) {
            let retryable = error_codes
                .iter()
                .find(|def| def.code == code)
                .map(|def| def.retryable)
                .unwrap_or(false);
            return StepError::Block {
                code: code.to_string(),
                message: rest.to_string(),
                retryable,
                details: None,
            };
        }
        StepError::Block {
            code: "EXEC_001".to_string(),
            message: message.to_string(),
            retryable: false,
            details: None,
        }
    }

    /// Stable machine-readable code for this error, used in StepRun records.
    pub fn code(&self) -> &str {
        match self {
            StepError::SchemaValidation(_) => "SCHEMA_VALIDATION",
            StepError::TemplateRender(_) => "TEMPLATE_RENDER",
            StepError::Timeout(_) => "TIMEOUT",
            StepError::HttpStatus { .. } => "HTTP_STATUS",
            StepError::RateLimit { .. } => "RATE_LIMIT",
            StepError::MaxIterations(_) => "MAX_ITERATIONS",
            StepError::Cancelled => "CANCELLED",
            StepError::BlockNotFound(_) => "BLOCK_NOT_FOUND",
            StepError::Block { code, .. } => code,
            StepError::Sandbox(SandboxError::Timeout(_)) => "TIMEOUT",
            StepError::Sandbox(_) => "SANDBOX",
            StepError::Internal(_) => "INTERNAL",
        }
    }
}

fn parse_code_prefix(message: &str) -> Option<(&str, &str)> {
    let trimmed = message.trim_start();
    let rest = trimmed.strip_prefix('[')?;
    let end = rest.find(']')?;
    let code = &rest[..end];
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((code, rest[end + 1..].trim_start()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes() -> Vec<ErrorCodeDef> {
        vec![
            ErrorCodeDef {
                code: "GITHUB_002".into(),
                name: "RATE_LIMIT".into(),
                description: "Secondary rate limit".into(),
                retryable: true,
            },
            ErrorCodeDef {
                code: "GITHUB_404".into(),
                name: "NOT_FOUND".into(),
                description: "Repository not found".into(),
                retryable: false,
            },
        ]
    }

    #[test]
    fn test_classify_known_retryable_code() {
        let err = StepError::classify_thrown("[GITHUB_002] slow down", &codes());
        assert!(err.retryable());
        assert_eq!(err.code(), "GITHUB_002");
        assert_eq!(err.to_string(), "[GITHUB_002] slow down");
    }

    #[test]
    fn test_classify_known_nonretryable_code() {
        let err = StepError::classify_thrown("[GITHUB_404] no such repo", &codes());
        assert!(!err.retryable());
    }

    #[test]
    fn test_classify_unknown_code_defaults_nonretryable() {
        let err = StepError::classify_thrown("[MYSTERY_1] what", &codes());
        assert!(!err.retryable());
        assert_eq!(err.code(), "MYSTERY_1");
    }

    #[test]
    fn test_classify_unprefixed_message() {
        let err = StepError::classify_thrown("plain failure", &codes());
        assert_eq!(err.code(), "EXEC_001");
        assert!(!err.retryable());
    }

    #[test]
    fn test_http_status_retryability() {
        let server = StepError::HttpStatus {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(server.retryable());

        let client = StepError::HttpStatus {
            status: 404,
            message: "missing".into(),
        };
        assert!(!client.retryable());

        let throttled = StepError::HttpStatus {
            status: 429,
            message: "too many".into(),
        };
        assert!(throttled.retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(StepError::Timeout(30_000).retryable());
        assert!(!StepError::Cancelled.retryable());
        assert!(!StepError::SchemaValidation("bad".into()).retryable());
    }
}
