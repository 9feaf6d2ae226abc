//! Provider error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Model file does not exist: {}", .0.display())]
    ModelFileNotFound(PathBuf),

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Local model is not available: {0}")]
    ModelUnavailable(String),

    #[error("Session {0} is no longer valid")]
    SessionInvalid(String),

    #[error("No enabled cloud provider configurations")]
    NoEnabledProviders,

    #[error("All cloud providers failed. Last error: {0}")]
    AllProvidersFailed(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Generation failed: {0}")]
    Execution(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Condense an API error body for display, pulling the human message out of
/// JSON when there is one.
///
/// Cloud backends disagree on shape: `{"error": {"message": ...}}` (OpenAI,
/// Anthropic), the same with a `status` field (Google), a bare
/// `{"error": "..."}`, or a top-level `{"message": "..."}`. Anything
/// unrecognized comes back unchanged, with any `HTTP NNN:` prefix preserved.
#[must_use]
pub fn condense_api_error(error: &str) -> String {
    let Some(json_start) = error.find('{') else {
        return error.to_string();
    };

    let Ok(json) = serde_json::from_str::<serde_json::Value>(&error[json_start..]) else {
        return error.to_string();
    };

    let Some(message) = error_message(&json) else {
        return error.to_string();
    };

    let prefix = error[..json_start].trim();
    if prefix.is_empty() {
        message
    } else {
        format!("{prefix} {message}")
    }
}

fn error_message(json: &serde_json::Value) -> Option<String> {
    if let Some(error) = json.get("error") {
        if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
            return Some(message.to_string());
        }
        if let Some(message) = error.as_str() {
            return Some(message.to_string());
        }
    }
    json.get("message")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condense_nested_error() {
        let error = r#"HTTP 429: {"error":{"message":"Rate limit exceeded","type":"rate_limit_error"}}"#;
        assert_eq!(condense_api_error(error), "HTTP 429: Rate limit exceeded");
    }

    #[test]
    fn test_condense_string_error() {
        assert_eq!(
            condense_api_error(r#"{"error":"Invalid API key"}"#),
            "Invalid API key"
        );
    }

    #[test]
    fn test_condense_top_level_message() {
        assert_eq!(
            condense_api_error(r#"{"message":"Quota exhausted"}"#),
            "Quota exhausted"
        );
    }

    #[test]
    fn test_condense_plain_text_unchanged() {
        assert_eq!(condense_api_error("Connection refused"), "Connection refused");
    }

    #[test]
    fn test_condense_unparseable_json_unchanged() {
        assert_eq!(
            condense_api_error("HTTP 500: {not json}"),
            "HTTP 500: {not json}"
        );
    }
}
