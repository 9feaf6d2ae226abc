//! Stateful local conversation sessions.
//!
//! A session pins one llama context (and its KV cache) across the turns of a
//! windowed refinement conversation. Sessions only exist while the model is
//! resident; unloading the model invalidates all of them.

use std::fmt;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::provider::ProviderError;

use super::LocalModelManager;
use super::manager::runtime_gone;
use super::runtime::Command;

/// Opaque handle to a live session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct LocalSessionRegistry {
    commands: mpsc::Sender<Command>,
}

impl LocalSessionRegistry {
    #[must_use]
    pub fn new(manager: &LocalModelManager) -> Self {
        Self {
            commands: manager.commands(),
        }
    }

    /// Create a session with a fresh context. Fails unless the model is
    /// loaded.
    pub async fn start_session(&self) -> Result<SessionId, ProviderError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::StartSession { reply })
            .await
            .map_err(|_| runtime_gone())?;
        response.await.map_err(|_| runtime_gone())?
    }

    /// Dispose a session and its context. Unknown ids are ignored.
    pub async fn end_session(&self, id: &SessionId) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::EndSession {
                id: id.clone(),
                reply,
            })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    /// Look up a live session. `None` for ids that were ended or invalidated
    /// by an unload.
    pub async fn get_session(&self, id: &SessionId) -> Option<SessionId> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::HasSession {
                id: id.clone(),
                reply,
            })
            .await
            .ok()?;
        match response.await {
            Ok(true) => Some(id.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_session_requires_loaded_model() {
        let manager = LocalModelManager::new();
        let sessions = LocalSessionRegistry::new(&manager);
        let result = sessions.start_session().await;
        assert!(matches!(result, Err(ProviderError::ModelUnavailable(_))));
    }

    #[tokio::test]
    async fn test_get_session_unknown_id_is_none() {
        let manager = LocalModelManager::new();
        let sessions = LocalSessionRegistry::new(&manager);
        let id = SessionId::new();
        assert!(sessions.get_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_end_session_unknown_id_is_quiet() {
        let manager = LocalModelManager::new();
        let sessions = LocalSessionRegistry::new(&manager);
        sessions.end_session(&SessionId::new()).await;
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
