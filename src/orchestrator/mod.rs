//! Request orchestration.
//!
//! One [`ConversationOrchestrator::execute`] call drives a request from
//! hotkey to output: capture the text, pick a provider, build the
//! transcript, generate, then either paste in place or run the windowed
//! refinement loop. Every request ends in exactly one of three ways: pasted
//! output, a reviewed result window, or a failure notification.

pub mod ports;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::action::{Action, ExecutionRequest};
use crate::config::ProviderSettings;
use crate::error::EngineError;
use crate::local::{LocalModelManager, LocalSessionRegistry, SessionId};
use crate::provider::registry::ProviderRegistry;
use crate::provider::{AiProvider, AiResponse, ChatMessage, ProviderError, ProviderKind};
use crate::telemetry::{HistoryEntry, HistorySink};

use ports::{RefinementRequest, ResultWindowData, Severity, SystemPort, UiPort};

/// Marker separating the main output from the model's explanation of its
/// changes. Part of the prompt contract; changing it breaks parsing of
/// responses generated with the old marker.
pub const EXPLANATION_DELIMITER: &str = "---EXPLANATION---";

struct LocalHandles {
    manager: Arc<LocalModelManager>,
    sessions: Arc<LocalSessionRegistry>,
}

pub struct ConversationOrchestrator {
    registry: Arc<ProviderRegistry>,
    settings: ProviderSettings,
    ui: Arc<dyn UiPort>,
    system: Arc<dyn SystemPort>,
    history: Arc<dyn HistorySink>,
    local: Option<LocalHandles>,
}

impl ConversationOrchestrator {
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        settings: ProviderSettings,
        ui: Arc<dyn UiPort>,
        system: Arc<dyn SystemPort>,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        Self {
            registry,
            settings,
            ui,
            system,
            history,
            local: None,
        }
    }

    /// Wire in the local model so windowed requests on the `"Local"`
    /// provider get a pinned session across refinement turns.
    #[must_use]
    pub fn with_local(
        mut self,
        manager: Arc<LocalModelManager>,
        sessions: Arc<LocalSessionRegistry>,
    ) -> Self {
        self.local = Some(LocalHandles { manager, sessions });
        self
    }

    /// Run one request end to end. Failures are reported through the UI
    /// port; this never panics the host's hotkey handler.
    pub async fn execute(&self, request: ExecutionRequest) {
        self.execute_with_cancel(request, CancellationToken::new())
            .await;
    }

    /// [`execute`](Self::execute) with a host-controlled token. Cancelling
    /// stops the local token loop after the current decode step and aborts an
    /// in-flight cloud call; the request then reports "Cancelled." instead of
    /// an error.
    pub async fn execute_with_cancel(&self, request: ExecutionRequest, cancel: CancellationToken) {
        let started = Instant::now();

        match self.run(&request, &cancel, started).await {
            Ok(()) => {}
            Err(EngineError::InputEmpty) => {
                self.ui
                    .notify("No text selected or clipboard is empty.", Severity::Warning);
            }
            Err(EngineError::Provider(ProviderError::Cancelled)) => {
                self.ui.notify("Cancelled.", Severity::Info);
            }
            Err(error) => {
                warn!("action '{}' failed: {error}", request.action.name);
                self.ui.notify(&format!("Error: {error}"), Severity::Error);
            }
        }
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), EngineError> {
        let input = self
            .system
            .capture_text()
            .await
            .map_err(|error| EngineError::Output(format!("failed to capture text: {error:#}")))?;
        if input.trim().is_empty() {
            return Err(EngineError::InputEmpty);
        }

        let provider = self.select_provider(request.provider_override.as_deref())?;

        let mut transcript = vec![
            ChatMessage::system(build_instruction(&request.action)),
            ChatMessage::user(format!("{}{}", request.action.prefix, input)),
        ];

        if request.force_open_in_window || request.action.open_in_window {
            self.run_windowed(request, &provider, &mut transcript, &input, cancel, started)
                .await
        } else {
            let response = provider.generate(&transcript, None, cancel).await?;
            let (main_output, _) = split_output(&response.text, request.action.explain_changes);
            self.record_history(request, provider.name(), &input, &response, started);
            self.system
                .paste_text(&main_output)
                .await
                .map_err(|error| EngineError::Output(format!("failed to paste result: {error:#}")))?;
            self.notify_completed(&request.action.name, started);
            Ok(())
        }
    }

    async fn run_windowed(
        &self,
        request: &ExecutionRequest,
        provider: &Arc<dyn AiProvider>,
        transcript: &mut Vec<ChatMessage>,
        input: &str,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), EngineError> {
        let mut session: Option<SessionId> = None;
        if provider.kind() == ProviderKind::Local
            && let Some(local) = &self.local
        {
            // The model must be resident before the first turn so later
            // turns can reuse the session's KV cache.
            local.manager.load_model(&self.settings).await?;
            session = Some(local.sessions.start_session().await?);
        }

        let outcome = self
            .windowed_loop(request, provider.as_ref(), transcript, input, session.as_ref(), cancel, started)
            .await;

        if let Some(id) = session
            && let Some(local) = &self.local
        {
            local.sessions.end_session(&id).await;
        }
        outcome
    }

    async fn windowed_loop(
        &self,
        request: &ExecutionRequest,
        provider: &dyn AiProvider,
        transcript: &mut Vec<ChatMessage>,
        input: &str,
        session: Option<&SessionId>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), EngineError> {
        let mut first_turn = true;
        loop {
            let turn_started = if first_turn { started } else { Instant::now() };
            first_turn = false;

            let response = provider.generate(transcript, session, cancel).await?;
            let (main_content, explanation) =
                split_output(&response.text, request.action.explain_changes);
            self.record_history(request, provider.name(), input, &response, turn_started);

            let refinement = self
                .ui
                .show_result(ResultWindowData {
                    action_name: request.action.name.clone(),
                    main_content,
                    explanation,
                })
                .await;

            match refinement {
                Some(RefinementRequest { instruction }) => {
                    transcript.push(ChatMessage::assistant(response.text));
                    transcript.push(ChatMessage::user(instruction));
                }
                None => {
                    self.notify_completed(&request.action.name, started);
                    return Ok(());
                }
            }
        }
    }

    /// Resolve which provider handles this request: an explicit override
    /// wins, then the configured primary, then the fallback (with a warning
    /// notice). Names that resolve to nothing are skipped, so a fallback of
    /// `"None"` disables that layer.
    fn select_provider(&self, override_name: Option<&str>) -> Result<Arc<dyn AiProvider>, EngineError> {
        if let Some(name) = override_name
            && !name.trim().is_empty()
            && let Some(provider) = self.registry.get(name)
        {
            return Ok(provider);
        }

        if let Some(provider) = self.registry.get(&self.settings.primary_service_type) {
            return Ok(provider);
        }

        if let Some(provider) = self.registry.get(&self.settings.fallback_service_type) {
            self.ui.notify(
                &format!(
                    "Primary provider '{}' not available. Using fallback.",
                    self.settings.primary_service_type
                ),
                Severity::Warning,
            );
            return Ok(provider);
        }

        Err(EngineError::NoProviderAvailable)
    }

    /// Fire-and-forget history write. A failing sink warns and moves on.
    fn record_history(
        &self,
        request: &ExecutionRequest,
        provider_label: &str,
        input: &str,
        response: &AiResponse,
        turn_started: Instant,
    ) {
        let elapsed = turn_started.elapsed();
        let seconds = elapsed.as_secs_f64();
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            action_name: request.action.name.clone(),
            provider_label: provider_label.to_string(),
            model_label: response.model_label.clone(),
            input: input.to_string(),
            output: response.text.clone(),
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            latency_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            tokens_per_second: if seconds > 0.0 {
                f64::from(response.usage.completion_tokens) / seconds
            } else {
                0.0
            },
        };

        let history = Arc::clone(&self.history);
        let ui = Arc::clone(&self.ui);
        tokio::spawn(async move {
            if let Err(error) = history.add_entry(entry).await {
                warn!("failed to log history: {error:#}");
                ui.notify("Failed to log history", Severity::Warning);
            }
        });
    }

    fn notify_completed(&self, action_name: &str, started: Instant) {
        let seconds = started.elapsed().as_secs_f64();
        self.ui.notify(
            &format!("'{action_name}' completed in {seconds:.2}s."),
            Severity::Success,
        );
    }
}

/// System-prompt text for an action. Explain-changes actions get the
/// delimiter contract appended.
#[must_use]
pub fn build_instruction(action: &Action) -> String {
    if action.explain_changes {
        format!(
            "{}\n\nIMPORTANT: After the main response, add a section that starts with \
             '{EXPLANATION_DELIMITER}' and explain the changes you made.",
            action.instruction
        )
    } else {
        action.instruction.clone()
    }
}

/// Split a raw reply into main output and optional explanation. Without the
/// explain-changes flag the delimiter is treated as ordinary text.
#[must_use]
pub fn split_output(raw: &str, explain_changes: bool) -> (String, Option<String>) {
    if explain_changes
        && let Some((main, explanation)) = raw.split_once(EXPLANATION_DELIMITER)
    {
        (main.trim().to_string(), Some(explanation.trim().to_string()))
    } else {
        (raw.trim().to_string(), None)
    }
}
