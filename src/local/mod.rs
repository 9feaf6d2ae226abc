//! Local llama.cpp inference.
//!
//! Split across four pieces: [`runtime`] owns the llama handles on a
//! dedicated thread, [`manager::LocalModelManager`] is the async lifecycle
//! facade, [`session::LocalSessionRegistry`] tracks stateful conversations,
//! and [`engine::LocalInferenceEngine`] is the `AiProvider` the orchestrator
//! sees.

pub mod engine;
pub mod manager;
mod runtime;
pub mod session;

pub use engine::LocalInferenceEngine;
pub use manager::LocalModelManager;
pub use session::{LocalSessionRegistry, SessionId};

/// Lifecycle of the local model.
///
/// `Error` holds the captured failure message; a retry moves back through
/// `Loading`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    NotLoaded,
    Loading,
    Loaded,
    Error(String),
}

impl ModelStatus {
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }
}
