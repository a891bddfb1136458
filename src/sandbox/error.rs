//! Sandbox error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Code too large: {actual} bytes (max {max})")]
    CodeTooLarge { max: usize, actual: usize },
    #[error("Forbidden syntax: {0}")]
    ForbiddenSyntax(String),
    #[error("Syntax error: {0}")]
    Syntax(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Execution timed out after {0}ms")]
    Timeout(u64),
    #[error("Execution cancelled")]
    Cancelled,
    #[error("Output too large: {actual} bytes (max {max})")]
    OutputTooLarge { max: usize, actual: usize },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Internal sandbox error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// The message thrown from JS, with the interpreter's `Error:` prefix
    /// stripped, for `[CODE]` classification.
    pub fn thrown_message(&self) -> Option<&str> {
        let SandboxError::Execution(message) = self else {
            return None;
        };
        let stripped = message
            .split_once(": ")
            .filter(|(head, _)| head.ends_with("Error") && !head.contains(' '))
            .map(|(_, rest)| rest)
            .unwrap_or(message);
        Some(stripped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thrown_message_strips_error_prefix() {
        let err = SandboxError::Execution("Error: [GITHUB_002] rate limited".into());
        assert_eq!(err.thrown_message(), Some("[GITHUB_002] rate limited"));

        let err = SandboxError::Execution("TypeError: x is not a function".into());
        assert_eq!(err.thrown_message(), Some("x is not a function"));

        let err = SandboxError::Execution("[PLAIN_1] no prefix".into());
        assert_eq!(err.thrown_message(), Some("[PLAIN_1] no prefix"));
    }

    #[test]
    fn test_thrown_message_only_for_execution() {
        assert_eq!(SandboxError::Timeout(100).thrown_message(), None);
        assert_eq!(SandboxError::Cancelled.thrown_message(), None);
    }
}
