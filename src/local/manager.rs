//! Local model lifecycle facade.

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::ProviderSettings;
use crate::provider::ProviderError;

use super::ModelStatus;
use super::runtime::{self, Command};

/// Async handle to the model thread. Cheap to share; there is exactly one
/// model thread behind any number of clones of the internal sender, so the
/// weights are allocated at most once.
pub struct LocalModelManager {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ModelStatus>,
}

impl LocalModelManager {
    #[must_use]
    pub fn new() -> Self {
        let (status_tx, status_rx) = watch::channel(ModelStatus::NotLoaded);
        let commands = runtime::spawn(status_tx);
        Self {
            commands,
            status: status_rx,
        }
    }

    #[must_use]
    pub fn status(&self) -> ModelStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.status().is_loaded()
    }

    /// Message captured from the most recent failed load, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.status().error().map(ToString::to_string)
    }

    /// Watch status transitions (`NotLoaded -> Loading -> Loaded | Error`).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ModelStatus> {
        self.status.clone()
    }

    /// Load the model. A no-op when a load is in flight or already done;
    /// after a failure the next call retries.
    pub async fn load_model(&self, settings: &ProviderSettings) -> Result<(), ProviderError> {
        if matches!(self.status(), ModelStatus::Loading | ModelStatus::Loaded) {
            debug!("model load requested while already loading or loaded");
            return Ok(());
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Load {
                settings: Box::new(settings.clone()),
                reply,
            })
            .await
            .map_err(|_| runtime_gone())?;
        response.await.map_err(|_| runtime_gone())?
    }

    /// Unload the model and free its memory. Safe to call at any time;
    /// returns once the weights are actually gone.
    pub async fn unload_model(&self) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Unload { reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    pub(crate) fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }
}

impl Default for LocalModelManager {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn runtime_gone() -> ProviderError {
    ProviderError::ModelUnavailable("model runtime thread is gone".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_path(path: std::path::PathBuf) -> ProviderSettings {
        ProviderSettings {
            local_model_path: path,
            ..ProviderSettings::default()
        }
    }

    #[tokio::test]
    async fn test_initial_status_is_not_loaded() {
        let manager = LocalModelManager::new();
        assert_eq!(manager.status(), ModelStatus::NotLoaded);
        assert!(!manager.is_loaded());
        assert!(manager.last_error().is_none());
    }

    #[tokio::test]
    async fn test_load_with_unset_path_errors() {
        let manager = LocalModelManager::new();
        let result = manager.load_model(&ProviderSettings::default()).await;
        assert!(matches!(result, Err(ProviderError::ModelFileNotFound(_))));
        assert!(manager.last_error().is_some());
    }

    #[tokio::test]
    async fn test_load_with_missing_file_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = LocalModelManager::new();
        let settings = settings_with_path(dir.path().join("missing.gguf"));

        let result = manager.load_model(&settings).await;
        assert!(matches!(result, Err(ProviderError::ModelFileNotFound(_))));

        let status = manager.status();
        assert!(status.error().is_some_and(|m| m.contains("missing.gguf")));
    }

    #[tokio::test]
    async fn test_failed_load_can_be_retried() {
        let manager = LocalModelManager::new();
        let settings = ProviderSettings::default();
        assert!(manager.load_model(&settings).await.is_err());
        // Error state does not latch; a second attempt runs again.
        assert!(manager.load_model(&settings).await.is_err());
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let manager = LocalModelManager::new();
        manager.unload_model().await;
        manager.unload_model().await;
        assert_eq!(manager.status(), ModelStatus::NotLoaded);
    }

    #[tokio::test]
    async fn test_unload_clears_error_state() {
        let manager = LocalModelManager::new();
        let _ = manager.load_model(&ProviderSettings::default()).await;
        assert!(manager.last_error().is_some());
        manager.unload_model().await;
        assert_eq!(manager.status(), ModelStatus::NotLoaded);
        assert!(manager.last_error().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_observes_error_transition() {
        let manager = LocalModelManager::new();
        let mut watcher = manager.subscribe();
        let _ = manager.load_model(&ProviderSettings::default()).await;
        watcher.changed().await.expect("status change");
        assert!(watcher.borrow().error().is_some());
    }
}
