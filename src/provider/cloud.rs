//! Cloud provider chain.
//!
//! The `"Cloud"` provider is not one endpoint but an ordered list of
//! configurations. Each request walks the enabled entries in order and
//! returns the first non-empty completion; a failure is logged and the next
//! entry is tried. Only when every entry has failed does the request fail.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{CloudProviderConfig, Vendor};
use crate::local::SessionId;
use crate::telemetry::UsageTracker;

use super::{
    AiProvider, AiResponse, ChatMessage, ProviderError, ProviderKind, Role, Usage,
    condense_api_error, create_http_client,
};

/// Output cap for backends that require an explicit limit (Anthropic).
const CLOUD_MAX_TOKENS: u32 = 2048;

pub struct CloudProviderChain {
    client: reqwest::Client,
    configs: Vec<CloudProviderConfig>,
    usage: Arc<dyn UsageTracker>,
}

impl CloudProviderChain {
    #[must_use]
    pub fn new(configs: Vec<CloudProviderConfig>, usage: Arc<dyn UsageTracker>) -> Self {
        Self {
            client: create_http_client(),
            configs,
            usage,
        }
    }

    async fn attempt(
        &self,
        config: &CloudProviderConfig,
        transcript: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<AiResponse, ProviderError> {
        let request = async {
            match config.vendor {
                Vendor::OpenAi => self.chat_openai_like(config, transcript, true).await,
                Vendor::OpenAiCompatible => {
                    // Self-hosted servers often run without auth.
                    let auth = !config.api_key.trim().is_empty();
                    self.chat_openai_like(config, transcript, auth).await
                }
                Vendor::Anthropic => self.chat_anthropic(config, transcript).await,
                Vendor::Google => self.chat_google(config, transcript).await,
            }
        };
        tokio::select! {
            () = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = request => result,
        }
    }

    async fn chat_openai_like(
        &self,
        config: &CloudProviderConfig,
        transcript: &[ChatMessage],
        include_auth: bool,
    ) -> Result<AiResponse, ProviderError> {
        let url = format!(
            "{}/v1/chat/completions",
            config.base_url().trim_end_matches('/')
        );
        let mut request = self.client.post(url);
        if include_auth {
            request = request.bearer_auth(config.api_key.trim());
        }
        let payload = json!({
            "model": config.model,
            "messages": openai_messages(transcript),
            "temperature": config.temperature,
        });

        let body = send(request.json(&payload)).await?;
        let text = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(AiResponse {
            text,
            usage: usage_from(&body, "prompt_tokens", "completion_tokens"),
            model_label: config.name.clone(),
        })
    }

    async fn chat_anthropic(
        &self,
        config: &CloudProviderConfig,
        transcript: &[ChatMessage],
    ) -> Result<AiResponse, ProviderError> {
        let url = format!("{}/v1/messages", config.base_url().trim_end_matches('/'));
        let request = self
            .client
            .post(url)
            .header("x-api-key", config.api_key.trim())
            .header("anthropic-version", "2023-06-01")
            .json(&anthropic_payload(config, transcript));
        let body = send(request).await?;
        let text = body
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(AiResponse {
            text,
            usage: usage_from(&body, "input_tokens", "output_tokens"),
            model_label: config.name.clone(),
        })
    }

    async fn chat_google(
        &self,
        config: &CloudProviderConfig,
        transcript: &[ChatMessage],
    ) -> Result<AiResponse, ProviderError> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            config.base_url().trim_end_matches('/'),
            config.model,
            config.api_key.trim()
        );
        let payload = json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [{"text": google_prompt(transcript)}]
                }
            ],
            "generationConfig": {
                "temperature": config.temperature
            }
        });

        let body = send(self.client.post(url).json(&payload)).await?;
        let text = body
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(AiResponse {
            text,
            usage: google_usage(&body),
            model_label: config.name.clone(),
        })
    }
}

#[async_trait]
impl AiProvider for CloudProviderChain {
    fn name(&self) -> &str {
        "Cloud"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    async fn generate(
        &self,
        transcript: &[ChatMessage],
        _session: Option<&SessionId>,
        cancel: &CancellationToken,
    ) -> Result<AiResponse, ProviderError> {
        let response = run_chain(&self.configs, cancel, |config| {
            self.attempt(config, transcript, cancel)
        })
        .await?;

        // Fire-and-forget. Usage accounting must not delay or fail a request.
        let usage = Arc::clone(&self.usage);
        let Usage {
            prompt_tokens,
            completion_tokens,
        } = response.usage;
        tokio::spawn(async move {
            if let Err(error) = usage
                .add_usage(u64::from(prompt_tokens), u64::from(completion_tokens))
                .await
            {
                warn!("failed to record token usage: {error:#}");
            }
        });

        Ok(response)
    }
}

/// Walk the enabled configurations in order until one yields a non-empty
/// response. Cancellation stops the walk instead of falling through to the
/// next entry.
async fn run_chain<'a, F, Fut>(
    configs: &'a [CloudProviderConfig],
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<AiResponse, ProviderError>
where
    F: FnMut(&'a CloudProviderConfig) -> Fut,
    Fut: Future<Output = Result<AiResponse, ProviderError>>,
{
    let enabled: Vec<_> = configs.iter().filter(|c| c.enabled).collect();
    if enabled.is_empty() {
        return Err(ProviderError::NoEnabledProviders);
    }

    let mut last_error = String::new();
    for config in enabled {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        match attempt(config).await {
            Ok(response) if response.text.trim().is_empty() => {
                warn!(provider = %config.name, "empty response, trying next provider");
                last_error = ProviderError::EmptyResponse.to_string();
            }
            Ok(response) => return Ok(response),
            Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
            Err(error) => {
                let condensed = condense_api_error(&error.to_string());
                warn!(provider = %config.name, error = %condensed, "provider failed, trying next");
                last_error = condensed;
            }
        }
    }
    Err(ProviderError::AllProvidersFailed(last_error))
}

async fn send(request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Execution(format!(
            "HTTP {}: {body}",
            status.as_u16()
        )));
    }
    Ok(response.json().await?)
}

fn openai_messages(transcript: &[ChatMessage]) -> Vec<Value> {
    transcript
        .iter()
        .map(|message| {
            json!({
                "role": role_name(message.role),
                "content": message.content,
            })
        })
        .collect()
}

/// The system prompt is a top-level field that must be omitted entirely when
/// the transcript has no system message; the endpoint rejects a `null` there.
fn anthropic_payload(config: &CloudProviderConfig, transcript: &[ChatMessage]) -> Value {
    let (system, messages) = anthropic_messages(transcript);
    let mut payload = json!({
        "model": config.model,
        "max_tokens": CLOUD_MAX_TOKENS,
        "messages": messages,
        "temperature": config.temperature,
    });
    if let Some(system) = system {
        payload["system"] = Value::String(system);
    }
    payload
}

/// Anthropic takes the system prompt as a top-level field; multiple system
/// messages are folded together.
fn anthropic_messages(transcript: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut messages = Vec::new();
    for message in transcript {
        match message.role {
            Role::System => match system {
                Some(ref mut prompt) => {
                    prompt.push_str("\n\n");
                    prompt.push_str(&message.content);
                }
                None => system = Some(message.content.clone()),
            },
            Role::User | Role::Assistant => {
                messages.push(json!({
                    "role": role_name(message.role),
                    "content": [{"type": "text", "text": message.content}],
                }));
            }
        }
    }
    (system, messages)
}

/// Gemini generateContent gets the transcript flattened into one user part.
fn google_prompt(transcript: &[ChatMessage]) -> String {
    transcript
        .iter()
        .map(|message| format!("{}: {}", role_name(message.role), message.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn google_usage(body: &Value) -> Usage {
    let count = |key: &str| {
        body.pointer(&format!("/usageMetadata/{key}"))
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    Usage {
        prompt_tokens: count("promptTokenCount"),
        completion_tokens: count("candidatesTokenCount"),
    }
}

fn usage_from(body: &Value, prompt_key: &str, completion_key: &str) -> Usage {
    let Some(usage) = body.get("usage") else {
        return Usage::default();
    };
    let count = |key: &str| {
        usage
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    Usage {
        prompt_tokens: count(prompt_key),
        completion_tokens: count(completion_key),
    }
}
