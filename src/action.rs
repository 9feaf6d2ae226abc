//! User-defined actions.

use serde::{Deserialize, Serialize};

/// A reusable AI task the user triggers on selected text, like "Proofread"
/// or "Summarize".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Unique user-facing name.
    pub name: String,
    /// System prompt: the rules for this task.
    pub instruction: String,
    /// Short phrase prepended to the captured text.
    #[serde(default)]
    pub prefix: String,
    /// Show the result in a review window instead of pasting in place.
    #[serde(default)]
    pub open_in_window: bool,
    /// Augment the prompt to ask the model to explain its changes.
    #[serde(default)]
    pub explain_changes: bool,
}

impl Action {
    #[must_use]
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            prefix: String::new(),
            open_in_window: false,
            explain_changes: false,
        }
    }
}

/// One hotkey-triggered invocation of an action.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub action: Action,
    /// Provider name that bypasses the configured primary/fallback policy.
    pub provider_override: Option<String>,
    /// Force the review window regardless of the action's own setting.
    pub force_open_in_window: bool,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            provider_override: None,
            force_open_in_window: false,
        }
    }
}
