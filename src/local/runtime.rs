//! Dedicated model thread.
//!
//! llama.cpp handles are not `Send`, and contexts borrow the model weights,
//! so the backend, the weights and every context live on one OS thread. All
//! operations arrive as [`Command`]s on a single queue, which doubles as the
//! mutual-exclusion path: loads are serialized, exactly one generation runs
//! at a time, and a session can never be dropped mid-generation. Unload ends
//! the serve scope, which drops the session contexts before the weights.

use std::collections::HashMap;
use std::num::NonZeroU32;

use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProviderSettings;
use crate::provider::{ChatMessage, ProviderError, Role, Usage};

use super::ModelStatus;
use super::session::SessionId;

/// Layer count that offloads the entire model on any current hardware.
const GPU_ALL_LAYERS: u32 = 99;

#[derive(Debug)]
pub(crate) struct Generated {
    pub text: String,
    pub usage: Usage,
}

pub(crate) enum Command {
    Load {
        settings: Box<ProviderSettings>,
        reply: oneshot::Sender<Result<(), ProviderError>>,
    },
    Unload {
        reply: oneshot::Sender<()>,
    },
    StartSession {
        reply: oneshot::Sender<Result<SessionId, ProviderError>>,
    },
    EndSession {
        id: SessionId,
        reply: oneshot::Sender<()>,
    },
    HasSession {
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Generate {
        transcript: Vec<ChatMessage>,
        session: Option<SessionId>,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<Generated, ProviderError>>,
    },
}

/// Spawn the model thread. Dropping every command sender shuts it down.
pub(crate) fn spawn(status: watch::Sender<ModelStatus>) -> mpsc::Sender<Command> {
    let (tx, mut rx) = mpsc::channel(32);
    let spawned = std::thread::Builder::new()
        .name("redraft-llama".to_string())
        .spawn(move || {
            let mut loader = LlamaLoader::default();
            run_loop(&mut loader, &mut rx, &status);
        });
    if let Err(error) = spawned {
        warn!("failed to spawn model thread: {error}");
    }
    tx
}

/// Loads weights and hands back an arena for opening contexts against them.
/// The seam lets the command loop run under test with fake weights.
trait ModelLoader {
    type Arena<'a>: SessionArena
    where
        Self: 'a;

    fn load(&mut self, settings: &ProviderSettings) -> Result<Self::Arena<'_>, ProviderError>;

    /// Release the weights. Called only after the arena and every session
    /// context are gone.
    fn unload(&mut self);
}

/// Everything generation needs while a model is resident.
trait SessionArena {
    type Session;

    fn open_session(&self) -> Result<Self::Session, ProviderError>;

    fn generate(
        &self,
        session: &mut Self::Session,
        transcript: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<Generated, ProviderError>;
}

fn run_loop<L: ModelLoader>(
    loader: &mut L,
    rx: &mut mpsc::Receiver<Command>,
    status: &watch::Sender<ModelStatus>,
) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Load { settings, reply } => {
                let path = settings.local_model_path.clone();
                if path.as_os_str().is_empty() || !path.exists() {
                    let error = ProviderError::ModelFileNotFound(path);
                    let _ = status.send(ModelStatus::Error(error.to_string()));
                    let _ = reply.send(Err(error));
                    continue;
                }

                let _ = status.send(ModelStatus::Loading);
                let arena = match loader.load(&settings) {
                    Ok(arena) => arena,
                    Err(error) => {
                        warn!("failed to load local model: {error}");
                        let _ = status.send(ModelStatus::Error(error.to_string()));
                        // Loads already queued were requested while this
                        // attempt was in flight; they are dropped with its
                        // failure instead of running again.
                        reject_queued(rx, status);
                        let _ = reply.send(Err(error));
                        continue;
                    }
                };
                info!(path = %settings.local_model_path.display(), "local model loaded");
                let _ = status.send(ModelStatus::Loaded);
                let _ = reply.send(Ok(()));

                let exit = serve(&arena, rx);
                // Session contexts are gone once serve returns; the weights
                // go next, then the unload is acknowledged.
                drop(arena);
                loader.unload();
                match exit {
                    Exit::Unloaded(ack) => {
                        info!("local model unloaded");
                        let _ = status.send(ModelStatus::NotLoaded);
                        let _ = ack.send(());
                    }
                    Exit::Shutdown => return,
                }
            }
            other => idle(other, status),
        }
    }
}

/// Commands that arrive while no model is resident.
fn idle(command: Command, status: &watch::Sender<ModelStatus>) {
    match command {
        // Reached only through the post-failure drain: this load was queued
        // behind an attempt that failed, so it reports the captured failure
        // instead of starting over.
        Command::Load { reply, .. } => {
            let _ = reply.send(Err(unavailable(status)));
        }
        Command::Unload { reply } => {
            // Nothing loaded; idempotent.
            let _ = status.send(ModelStatus::NotLoaded);
            let _ = reply.send(());
        }
        Command::StartSession { reply } => {
            let _ = reply.send(Err(unavailable(status)));
        }
        Command::EndSession { reply, .. } => {
            let _ = reply.send(());
        }
        Command::HasSession { reply, .. } => {
            let _ = reply.send(false);
        }
        Command::Generate { reply, .. } => {
            let _ = reply.send(Err(unavailable(status)));
        }
    }
}

/// Drain commands that piled up behind a failed load attempt before its
/// failure was observable to callers.
fn reject_queued(rx: &mut mpsc::Receiver<Command>, status: &watch::Sender<ModelStatus>) {
    while let Ok(command) = rx.try_recv() {
        idle(command, status);
    }
}

enum Exit {
    Unloaded(oneshot::Sender<()>),
    Shutdown,
}

struct SessionState<'m> {
    ctx: LlamaContext<'m>,
    /// Tokens already in the KV cache. Zero means the next prompt must
    /// render the whole transcript.
    past_tokens: usize,
}

/// Command loop while a model is resident. Returns when an unload arrives or
/// the queue closes; session state drops with this scope.
fn serve<A: SessionArena>(arena: &A, rx: &mut mpsc::Receiver<Command>) -> Exit {
    let mut sessions: HashMap<SessionId, A::Session> = HashMap::new();

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Load { reply, .. } => {
                // Already resident; the expensive path never runs twice.
                let _ = reply.send(Ok(()));
            }
            Command::Unload { reply } => return Exit::Unloaded(reply),
            Command::StartSession { reply } => {
                let started = arena.open_session().map(|session| {
                    let id = SessionId::new();
                    sessions.insert(id.clone(), session);
                    id
                });
                let _ = reply.send(started);
            }
            Command::EndSession { id, reply } => {
                sessions.remove(&id);
                let _ = reply.send(());
            }
            Command::HasSession { id, reply } => {
                let _ = reply.send(sessions.contains_key(&id));
            }
            Command::Generate {
                transcript,
                session,
                cancel,
                reply,
            } => {
                let result = match session {
                    Some(id) => match sessions.get_mut(&id) {
                        Some(state) => arena.generate(state, &transcript, &cancel),
                        None => Err(ProviderError::SessionInvalid(id.to_string())),
                    },
                    None => arena.open_session().and_then(|mut transient| {
                        arena.generate(&mut transient, &transcript, &cancel)
                    }),
                };
                let _ = reply.send(result);
            }
        }
    }
    Exit::Shutdown
}

fn unavailable(status: &watch::Sender<ModelStatus>) -> ProviderError {
    let message = match &*status.borrow() {
        ModelStatus::Error(message) => message.clone(),
        _ => "model is not loaded".to_string(),
    };
    ProviderError::ModelUnavailable(message)
}

#[derive(Default)]
struct LlamaLoader {
    // Backend init is deferred so hosts that never touch local inference
    // pay nothing for it.
    backend: Option<LlamaBackend>,
    resident: Option<(LlamaModel, LlamaChatTemplate)>,
}

impl ModelLoader for LlamaLoader {
    type Arena<'a>
        = LlamaArena<'a>
    where
        Self: 'a;

    fn load(&mut self, settings: &ProviderSettings) -> Result<LlamaArena<'_>, ProviderError> {
        if self.backend.is_none() {
            let backend = LlamaBackend::init()
                .map_err(|e| ProviderError::ModelLoadFailed(format!("backend init failed: {e}")))?;
            self.backend = Some(backend);
        }
        let Some(backend) = self.backend.as_ref() else {
            return Err(ProviderError::ModelLoadFailed(
                "backend initialization failed".to_string(),
            ));
        };

        let (model, template) = &*self.resident.insert(load_model(backend, settings)?);
        Ok(LlamaArena {
            backend,
            model,
            template,
            settings: settings.clone(),
        })
    }

    fn unload(&mut self) {
        self.resident = None;
    }
}

/// Borrows of the resident weights plus the per-context settings.
struct LlamaArena<'a> {
    backend: &'a LlamaBackend,
    model: &'a LlamaModel,
    template: &'a LlamaChatTemplate,
    settings: ProviderSettings,
}

impl<'a> SessionArena for LlamaArena<'a> {
    type Session = SessionState<'a>;

    fn open_session(&self) -> Result<SessionState<'a>, ProviderError> {
        let ctx = new_context(self.backend, self.model, &self.settings)?;
        Ok(SessionState { ctx, past_tokens: 0 })
    }

    fn generate(
        &self,
        session: &mut SessionState<'a>,
        transcript: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<Generated, ProviderError> {
        run_generation(self.model, self.template, &self.settings, session, transcript, cancel)
    }
}

fn load_model(
    backend: &LlamaBackend,
    settings: &ProviderSettings,
) -> Result<(LlamaModel, LlamaChatTemplate), ProviderError> {
    let mut params = LlamaModelParams::default()
        .with_n_gpu_layers(if settings.prefer_gpu { GPU_ALL_LAYERS } else { 0 });
    if settings.local_model_memory_lock {
        params = params.with_use_mlock(true);
    }
    if !settings.local_model_memory_map {
        params = params.with_use_mmap(false);
    }

    let model = LlamaModel::load_from_file(backend, &settings.local_model_path, &params)
        .map_err(|e| ProviderError::ModelLoadFailed(e.to_string()))?;

    let template = match model.chat_template(None) {
        Ok(template) => template,
        Err(_) => {
            warn!("model has no embedded chat template, falling back to chatml");
            LlamaChatTemplate::new("chatml").map_err(|e| {
                ProviderError::ModelLoadFailed(format!("no usable chat template: {e}"))
            })?
        }
    };

    Ok((model, template))
}

fn new_context<'m>(
    backend: &LlamaBackend,
    model: &'m LlamaModel,
    settings: &ProviderSettings,
) -> Result<LlamaContext<'m>, ProviderError> {
    let mut params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(settings.local_model_context_size.max(1)));
    if settings.local_cpu_cores > 0 {
        let threads = i32::try_from(settings.local_cpu_cores).unwrap_or(i32::MAX);
        params = params.with_n_threads(threads).with_n_threads_batch(threads);
    }
    model
        .new_context(backend, params)
        .map_err(|e| ProviderError::Execution(format!("Failed to create context: {e}")))
}

/// Prefill the prompt window into the context's KV cache, then run the
/// autoregressive loop. Cancellation breaks the loop and returns whatever was
/// produced so far.
fn run_generation(
    model: &LlamaModel,
    template: &LlamaChatTemplate,
    settings: &ProviderSettings,
    state: &mut SessionState<'_>,
    transcript: &[ChatMessage],
    cancel: &CancellationToken,
) -> Result<Generated, ProviderError> {
    let window = prompt_window(state.past_tokens == 0, transcript);
    let chat_messages = to_llama_messages(window)?;
    let prompt = model
        .apply_chat_template(template, &chat_messages, true)
        .map_err(|e| ProviderError::Execution(format!("Failed to apply chat template: {e}")))?;
    let tokens = model
        .str_to_token(&prompt, AddBos::Never)
        .map_err(|e| ProviderError::Execution(format!("Failed to tokenize prompt: {e}")))?;

    let ctx = &mut state.ctx;
    let n_batch = (ctx.n_batch() as usize).max(1);
    for chunk in tokens.chunks(n_batch) {
        let mut batch = LlamaBatch::get_one(chunk)
            .map_err(|e| ProviderError::Execution(format!("Failed to create batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| ProviderError::Execution(format!("Prefill decode failed: {e}")))?;
    }

    let prompt_tokens = tokens.len();
    let budget = (settings.local_model_context_size as usize)
        .saturating_sub(state.past_tokens + prompt_tokens)
        .min(settings.local_model_max_tokens as usize);

    let mut sampler = build_sampler(settings.local_model_temperature);
    let mut decoder = encoding_rs::UTF_8.new_decoder();
    let mut text = String::new();
    let mut completion_tokens: u32 = 0;

    for _ in 0..budget {
        if cancel.is_cancelled() {
            break;
        }

        let token = sampler.sample(ctx, -1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            break;
        }
        completion_tokens += 1;

        let piece = model
            .token_to_piece(token, &mut decoder, true, None)
            .map_err(|e| ProviderError::Execution(format!("Failed to decode token: {e}")))?;
        text.push_str(&piece);

        let fed = [token];
        let mut batch = LlamaBatch::get_one(&fed)
            .map_err(|e| ProviderError::Execution(format!("Failed to create batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| ProviderError::Execution(format!("Decode failed: {e}")))?;
    }

    state.past_tokens += prompt_tokens + completion_tokens as usize;
    Ok(Generated {
        text,
        usage: Usage {
            prompt_tokens: u32::try_from(prompt_tokens).unwrap_or(u32::MAX),
            completion_tokens,
        },
    })
}

/// Select what gets rendered into the prompt. A fresh context needs the whole
/// transcript; a continuing one already holds the earlier turns in its KV
/// cache, so only the newest message is rendered.
pub(crate) fn prompt_window(first_turn: bool, transcript: &[ChatMessage]) -> &[ChatMessage] {
    if first_turn || transcript.len() <= 1 {
        transcript
    } else {
        &transcript[transcript.len() - 1..]
    }
}

fn to_llama_messages(messages: &[ChatMessage]) -> Result<Vec<LlamaChatMessage>, ProviderError> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            LlamaChatMessage::new(role.to_string(), message.content.clone())
                .map_err(|e| ProviderError::Execution(format!("Invalid chat message: {e}")))
        })
        .collect()
}

fn build_sampler(temperature: f32) -> LlamaSampler {
    if temperature <= 0.0 {
        return LlamaSampler::greedy();
    }
    LlamaSampler::chain_simple([
        LlamaSampler::top_k(40),
        LlamaSampler::top_p(0.95, 1),
        LlamaSampler::min_p(0.05, 1),
        LlamaSampler::temp(temperature),
        LlamaSampler::dist(0),
    ])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::provider::ChatMessage;

    fn transcript() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("proofread"),
            ChatMessage::user("teh text"),
            ChatMessage::assistant("the text"),
            ChatMessage::user("make it formal"),
        ]
    }

    #[test]
    fn test_first_turn_renders_full_transcript() {
        let transcript = transcript();
        let window = prompt_window(true, &transcript);
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn test_later_turns_render_only_latest_message() {
        let transcript = transcript();
        let window = prompt_window(false, &transcript);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "make it formal");
    }

    #[test]
    fn test_single_message_transcript_never_truncates() {
        let transcript = vec![ChatMessage::user("hi")];
        assert_eq!(prompt_window(false, &transcript).len(), 1);
        assert!(prompt_window(false, &[]).is_empty());
    }

    struct FakeSession;

    struct FakeArena {
        opens: Arc<AtomicUsize>,
    }

    impl SessionArena for FakeArena {
        type Session = FakeSession;

        fn open_session(&self) -> Result<FakeSession, ProviderError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession)
        }

        fn generate(
            &self,
            _session: &mut FakeSession,
            _transcript: &[ChatMessage],
            _cancel: &CancellationToken,
        ) -> Result<Generated, ProviderError> {
            Ok(Generated {
                text: "ok".to_string(),
                usage: Usage::default(),
            })
        }
    }

    struct FakeLoader {
        loads: Arc<AtomicUsize>,
        opens: Arc<AtomicUsize>,
        gate: Option<std::sync::mpsc::Receiver<()>>,
        fail: bool,
    }

    impl ModelLoader for FakeLoader {
        type Arena<'a>
            = FakeArena
        where
            Self: 'a;

        fn load(&mut self, _settings: &ProviderSettings) -> Result<FakeArena, ProviderError> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::ModelLoadFailed("corrupt weights".to_string()));
            }
            Ok(FakeArena {
                opens: Arc::clone(&self.opens),
            })
        }

        fn unload(&mut self) {}
    }

    struct Harness {
        commands: mpsc::Sender<Command>,
        status: watch::Receiver<ModelStatus>,
        loads: Arc<AtomicUsize>,
        opens: Arc<AtomicUsize>,
        model_file: tempfile::NamedTempFile,
    }

    fn harness(fail: bool, gate: Option<std::sync::mpsc::Receiver<()>>) -> Harness {
        let loads = Arc::new(AtomicUsize::new(0));
        let opens = Arc::new(AtomicUsize::new(0));
        let (commands, mut rx) = mpsc::channel(32);
        let (status_tx, status) = watch::channel(ModelStatus::NotLoaded);
        let thread_loads = Arc::clone(&loads);
        let thread_opens = Arc::clone(&opens);
        std::thread::spawn(move || {
            let mut loader = FakeLoader {
                loads: thread_loads,
                opens: thread_opens,
                gate,
                fail,
            };
            run_loop(&mut loader, &mut rx, &status_tx);
        });
        Harness {
            commands,
            status,
            loads,
            opens,
            model_file: tempfile::NamedTempFile::new().expect("temp model file"),
        }
    }

    impl Harness {
        fn send_load(&self) -> oneshot::Receiver<Result<(), ProviderError>> {
            let settings = ProviderSettings {
                local_model_path: self.model_file.path().to_path_buf(),
                ..ProviderSettings::default()
            };
            let (reply, response) = oneshot::channel();
            self.commands
                .blocking_send(Command::Load {
                    settings: Box::new(settings),
                    reply,
                })
                .expect("send load");
            response
        }

        fn start_session(&self) -> Result<SessionId, ProviderError> {
            let (reply, response) = oneshot::channel();
            self.commands
                .blocking_send(Command::StartSession { reply })
                .expect("send start");
            response.blocking_recv().expect("start reply")
        }

        fn has_session(&self, id: &SessionId) -> bool {
            let (reply, response) = oneshot::channel();
            self.commands
                .blocking_send(Command::HasSession {
                    id: id.clone(),
                    reply,
                })
                .expect("send has");
            response.blocking_recv().expect("has reply")
        }

        fn unload(&self) {
            let (reply, response) = oneshot::channel();
            self.commands
                .blocking_send(Command::Unload { reply })
                .expect("send unload");
            response.blocking_recv().expect("unload ack");
        }
    }

    #[test]
    fn test_concurrent_loads_allocate_once() {
        let h = harness(false, None);
        let first = h.send_load();
        let second = h.send_load();

        assert!(first.blocking_recv().expect("first reply").is_ok());
        assert!(second.blocking_recv().expect("second reply").is_ok());
        assert_eq!(h.loads.load(Ordering::SeqCst), 1);
        assert!(h.status.borrow().is_loaded());
    }

    #[test]
    fn test_unload_invalidates_live_sessions() {
        let h = harness(false, None);
        h.send_load()
            .blocking_recv()
            .expect("load reply")
            .expect("load");

        let id = h.start_session().expect("session");
        assert!(h.has_session(&id));
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        h.unload();
        assert!(!h.has_session(&id));
        assert_eq!(*h.status.borrow(), ModelStatus::NotLoaded);
    }

    #[test]
    fn test_load_queued_behind_failing_load_is_dropped() {
        let (open_gate, gate) = std::sync::mpsc::channel();
        let h = harness(true, Some(gate));
        let first = h.send_load();
        let second = h.send_load();
        open_gate.send(()).expect("gate");
        let _ = open_gate.send(());

        assert!(matches!(
            first.blocking_recv().expect("first reply"),
            Err(ProviderError::ModelLoadFailed(_))
        ));
        // The queued load reports the captured failure, it does not run.
        assert!(matches!(
            second.blocking_recv().expect("second reply"),
            Err(ProviderError::ModelUnavailable(_))
        ));
        assert_eq!(h.loads.load(Ordering::SeqCst), 1);
    }
}
