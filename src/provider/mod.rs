//! AI provider abstraction.
//!
//! Every text-generating backend (the local llama.cpp engine, the cloud
//! fallback chain) implements [`AiProvider`] and is looked up by name in the
//! [`registry::ProviderRegistry`]. The orchestrator only ever talks to this
//! trait.

pub mod cloud;
mod error;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::local::SessionId;

pub use error::{ProviderError, condense_api_error};

/// Default timeout for HTTP requests.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
/// Default connect timeout for HTTP requests.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create an HTTP client with standard timeouts.
#[must_use]
pub fn create_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry in a conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token counts for a single generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Result of one generation: raw text plus accounting metadata.
#[derive(Debug, Clone)]
pub struct AiResponse {
    pub text: String,
    pub usage: Usage,
    /// Human-readable label of what produced this (model file stem or
    /// cloud configuration name), for history display.
    pub model_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    Cloud,
}

/// A text-generating backend.
///
/// `session` is honored only by backends with stateful conversations; the
/// cloud chain ignores it and treats every call as one-shot.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn generate(
        &self,
        transcript: &[ChatMessage],
        session: Option<&SessionId>,
        cancel: &CancellationToken,
    ) -> Result<AiResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "hello");
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::Assistant).expect("serialize");
        assert_eq!(json, "\"assistant\"");
    }
}
