//! Local inference provider.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::provider::{AiProvider, AiResponse, ChatMessage, ProviderError, ProviderKind};

use super::manager::runtime_gone;
use super::runtime::Command;
use super::{LocalModelManager, SessionId};

/// The `"Local"` provider. Loads the model on demand, then hands the
/// transcript to the model thread for tokenization and the token loop.
pub struct LocalInferenceEngine {
    manager: Arc<LocalModelManager>,
    settings: ProviderSettings,
}

impl LocalInferenceEngine {
    #[must_use]
    pub fn new(manager: Arc<LocalModelManager>, settings: ProviderSettings) -> Self {
        Self { manager, settings }
    }

    /// Label shown in history: the model file stem.
    pub(crate) fn model_label(&self) -> String {
        self.settings
            .local_model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string())
    }
}

#[async_trait]
impl AiProvider for LocalInferenceEngine {
    fn name(&self) -> &str {
        "Local"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn generate(
        &self,
        transcript: &[ChatMessage],
        session: Option<&SessionId>,
        cancel: &CancellationToken,
    ) -> Result<AiResponse, ProviderError> {
        if !self.manager.is_loaded()
            && let Err(error) = self.manager.load_model(&self.settings).await
        {
            let message = self.manager.last_error().unwrap_or_else(|| error.to_string());
            return Err(ProviderError::ModelUnavailable(message));
        }

        let (reply, response) = oneshot::channel();
        self.manager
            .commands()
            .send(Command::Generate {
                transcript: transcript.to_vec(),
                session: session.cloned(),
                cancel: cancel.clone(),
                reply,
            })
            .await
            .map_err(|_| runtime_gone())?;
        let generated = response.await.map_err(|_| runtime_gone())??;

        Ok(AiResponse {
            text: generated.text.trim().to_string(),
            usage: generated.usage,
            model_label: self.model_label(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn engine_with_path(path: &str) -> LocalInferenceEngine {
        let settings = ProviderSettings {
            local_model_path: PathBuf::from(path),
            ..ProviderSettings::default()
        };
        LocalInferenceEngine::new(Arc::new(LocalModelManager::new()), settings)
    }

    #[test]
    fn test_model_label_is_file_stem() {
        let engine = engine_with_path("/models/qwen2.5-3b-instruct-q4_k_m.gguf");
        assert_eq!(engine.model_label(), "qwen2.5-3b-instruct-q4_k_m");
        assert_eq!(engine_with_path("").model_label(), "local");
    }

    #[test]
    fn test_provider_identity() {
        let engine = engine_with_path("/models/m.gguf");
        assert_eq!(engine.name(), "Local");
        assert_eq!(engine.kind(), ProviderKind::Local);
    }

    #[tokio::test]
    async fn test_generate_without_model_reports_unavailable() {
        let engine = engine_with_path("/nonexistent/model.gguf");
        let cancel = CancellationToken::new();
        let result = engine
            .generate(&[ChatMessage::user("hello")], None, &cancel)
            .await;
        match result {
            Err(ProviderError::ModelUnavailable(message)) => {
                assert!(message.contains("model.gguf"), "got: {message}");
            }
            other => panic!("expected ModelUnavailable, got {other:?}"),
        }
    }
}
