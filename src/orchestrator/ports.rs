//! Host-facing ports.
//!
//! The engine never touches the clipboard, windows, or toasts itself; the
//! host implements these traits and the orchestrator calls through them.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Payload for the review window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultWindowData {
    pub action_name: String,
    pub main_content: String,
    pub explanation: Option<String>,
}

/// A follow-up instruction typed into the review window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementRequest {
    pub instruction: String,
}

#[async_trait]
pub trait UiPort: Send + Sync {
    /// Show a transient notification.
    fn notify(&self, message: &str, severity: Severity);

    /// Present a result for review. Returns `Some` when the user asks for a
    /// refinement, `None` when they accept or close the window.
    async fn show_result(&self, data: ResultWindowData) -> Option<RefinementRequest>;
}

#[async_trait]
pub trait SystemPort: Send + Sync {
    /// Capture the text the action applies to (selection or clipboard).
    async fn capture_text(&self) -> anyhow::Result<String>;

    /// Deliver output back into the focused application.
    async fn paste_text(&self, text: &str) -> anyhow::Result<()>;
}
