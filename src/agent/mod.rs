//! Agents: a named telephony entry point, its progress channel and the
//! sessions of the calls it is answering.

pub mod acks;
pub mod builder;
pub mod directory;
pub mod progress;
pub mod registry;
pub mod session;

use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::Result;
use crate::config::{AgentOptions, SessionSettings};
use crate::llm::{BackendFactory, Llm, LlmParams};
use crate::protocol::{FunctionSet, InboundMessage};
use crate::transport::{CallEndpoint, IncomingCall};

pub use builder::AgentBuilder;
pub use directory::{AgentDirectory, AgentUpdate};
pub use progress::{Callback, CallbackClient, HttpCallback, ProgressChannel, ProgressListener};
pub use registry::SessionRegistry;
pub use session::{Phase, SessionHandle};

/// Sessions force-closed at once while an agent is destroyed.
const DESTROY_CONCURRENCY: usize = 16;

/// Public identity of an agent.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    /// Where the telephony platform reaches the agent.
    pub address: String,
    pub path: String,
    pub progress_path: String,
}

struct AgentInner {
    info: AgentInfo,
    prompt: RwLock<String>,
    options: RwLock<AgentOptions>,
    functions: Option<FunctionSet>,
    backend: Arc<dyn BackendFactory>,
    settings: Arc<SessionSettings>,
    progress: ProgressChannel,
    sessions: SessionRegistry,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

/// A running agent. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    /// Start answering calls from `endpoint`.
    fn start(
        info: AgentInfo,
        parts: AgentParts,
        mut endpoint: Box<dyn CallEndpoint>,
    ) -> Self {
        let agent = Self {
            inner: Arc::new(AgentInner {
                info,
                prompt: RwLock::new(parts.prompt),
                options: RwLock::new(parts.options),
                functions: parts.functions,
                backend: parts.backend,
                settings: Arc::new(parts.settings),
                progress: parts.progress,
                sessions: SessionRegistry::new(),
                accept_task: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        };
        tracing::info!(
            agent = %agent.name(),
            id = %agent.id(),
            address = %agent.inner.info.address,
            "agent created"
        );

        let acceptor = agent.clone();
        let task = tokio::spawn(async move {
            loop {
                match endpoint.accept().await {
                    Ok(Some(call)) => {
                        if let Err(err) = acceptor.accept_call(call).await {
                            tracing::error!(agent = %acceptor.name(), error = %err, "failed to start session");
                        }
                    }
                    Ok(None) => {
                        tracing::info!(agent = %acceptor.name(), "telephony endpoint closed");
                        break;
                    }
                    Err(err) => {
                        tracing::error!(agent = %acceptor.name(), error = %err, "telephony endpoint failed");
                        break;
                    }
                }
            }
        });
        *agent.accept_slot() = Some(task);
        agent
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.info.path
    }

    #[must_use]
    pub fn progress_path(&self) -> &str {
        &self.inner.info.progress_path
    }

    #[must_use]
    pub fn info(&self) -> AgentInfo {
        self.inner.info.clone()
    }

    #[must_use]
    pub fn functions(&self) -> Option<&FunctionSet> {
        self.inner.functions.as_ref()
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    #[must_use]
    pub fn progress(&self) -> &ProgressChannel {
        &self.inner.progress
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub async fn prompt(&self) -> String {
        self.inner.prompt.read().await.clone()
    }

    /// Replace the prompt for new calls and every live session.
    pub async fn set_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        *self.inner.prompt.write().await = prompt.clone();
        for session in self.inner.sessions.handles().await {
            if session.set_prompt(prompt.clone()).await.is_err() {
                tracing::debug!(call_id = %session.call_id(), "session ended before prompt update");
            }
        }
    }

    pub async fn options(&self) -> AgentOptions {
        self.inner.options.read().await.clone()
    }

    /// Merge `update` into the current options and push the result to every
    /// live session. Returns the merged options.
    pub async fn set_options(&self, update: &AgentOptions) -> AgentOptions {
        let merged = {
            let mut options = self.inner.options.write().await;
            *options = options.merged(update);
            options.clone()
        };
        tracing::info!(agent = %self.name(), options = ?merged, "options updated");
        for session in self.inner.sessions.handles().await {
            if session.set_options(merged.clone()).await.is_err() {
                tracing::debug!(call_id = %session.call_id(), "session ended before options update");
            }
        }
        merged
    }

    /// Attach a live progress listener.
    pub fn attach_progress(&self) -> ProgressListener {
        self.inner.progress.attach()
    }

    /// The progress listener attached as `id` went away.
    pub fn progress_closed(&self, id: u64) {
        tracing::info!(agent = %self.name(), listener = id, "progress listener closed");
        self.inner.progress.closed(id);
    }

    /// Run `handler` when the live progress listener disconnects.
    pub fn set_close_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.inner.progress.set_close_handler(handler);
    }

    /// Route a raw message from a progress listener to its session.
    pub async fn handle_progress_message(&self, raw: &str) {
        let message: InboundMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(agent = %self.name(), error = %err, message = raw, "malformed progress message");
                return;
            }
        };
        let Some(session) = self.inner.sessions.get(&message.call_id).await else {
            tracing::warn!(agent = %self.name(), call_id = %message.call_id, "progress message for unknown call");
            return;
        };
        let Some(results) = message.function_results else {
            tracing::debug!(call_id = %message.call_id, "progress message without function results");
            return;
        };
        if let Err(err) = session.deliver_function_results(results).await {
            tracing::warn!(call_id = %message.call_id, error = %err, "function results for a finished call");
        }
    }

    /// Start a session for a call that has already been accepted.
    ///
    /// # Errors
    /// Returns an error if the model adapter cannot be built for the call.
    pub async fn accept_call(&self, call: IncomingCall) -> Result<SessionHandle> {
        let options = self.options().await;
        let params = LlmParams {
            user: call.call_id.clone(),
            prompt: self.prompt().await,
            functions: self.inner.functions.clone(),
            options: options.clone(),
        };
        let llm = Llm::new(params, self.inner.backend.create(&call.call_id))?;
        let setup = session::SessionSetup {
            settings: Arc::clone(&self.inner.settings),
            listen_url: self.inner.info.path.clone(),
            options,
            progress: self.inner.progress.clone(),
            registry: self.inner.sessions.clone(),
        };
        Ok(session::spawn(call, llm, setup).await)
    }

    /// Hang up every live call, stop accepting new ones and drop the
    /// progress listener. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(agent = %self.name(), "destroying agent");
        self.inner.progress.clear_close_handler();
        let accept = self.accept_slot().take();
        if let Some(task) = accept {
            task.abort();
            // Once joined, any call it handed off is already registered.
            match task.await {
                Err(err) if err.is_panic() => {
                    tracing::error!(agent = %self.name(), error = %err, "accept loop panicked");
                }
                _ => {}
            }
        }

        let sessions = self.inner.sessions.handles().await;
        futures::stream::iter(sessions)
            .for_each_concurrent(DESTROY_CONCURRENCY, |session| async move {
                session.force_close().await;
            })
            .await;

        self.inner.progress.detach();
        tracing::info!(agent = %self.name(), "agent destroyed");
    }

    fn accept_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.accept_task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("info", &self.inner.info)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Everything an agent is built from besides its endpoint.
struct AgentParts {
    prompt: String,
    options: AgentOptions,
    functions: Option<FunctionSet>,
    backend: Arc<dyn BackendFactory>,
    settings: SessionSettings,
    progress: ProgressChannel,
}
