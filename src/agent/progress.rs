//! Fan-out of progress messages to a live listener and an HTTP callback.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};

use crate::Result;
use crate::protocol::{ProgressEvent, ProgressMessage};

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Delivers a progress message to a callback URL.
#[async_trait]
pub trait CallbackClient: Send + Sync {
    async fn deliver(&self, url: &str, message: &ProgressMessage) -> Result<()>;
}

/// POSTs progress messages as JSON; non-2xx responses count as failures.
#[derive(Clone, Debug)]
pub struct HttpCallback {
    client: Client,
}

impl HttpCallback {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new() -> Result<Self> {
        let client = Client::builder().pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT).build()?;
        Ok(Self { client })
    }

    #[must_use]
    pub const fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallbackClient for HttpCallback {
    async fn deliver(&self, url: &str, message: &ProgressMessage) -> Result<()> {
        self.client.post(url).json(message).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Where callback deliveries go.
#[derive(Clone)]
pub struct Callback {
    pub url: String,
    pub client: Arc<dyn CallbackClient>,
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback").field("url", &self.url).finish_non_exhaustive()
    }
}

type CloseHandler = Box<dyn FnOnce() + Send>;

/// The receiving end of one live attachment.
///
/// Each attachment carries its own id so that a listener which was replaced
/// can report its disconnect without tearing down its successor.
#[derive(Debug)]
pub struct ProgressListener {
    id: u64,
    rx: mpsc::UnboundedReceiver<ProgressMessage>,
}

impl ProgressListener {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.rx.recv().await
    }

    /// # Errors
    /// Returns an error if no message is queued or the listener was replaced.
    pub fn try_recv(&mut self) -> std::result::Result<ProgressMessage, TryRecvError> {
        self.rx.try_recv()
    }
}

struct Live {
    id: u64,
    tx: mpsc::UnboundedSender<ProgressMessage>,
}

struct Inner {
    agent: String,
    live: watch::Sender<Option<Live>>,
    next_id: AtomicU64,
    callback: Option<Callback>,
    tries: Arc<AtomicU32>,
    on_close: Mutex<Option<CloseHandler>>,
}

/// An agent's progress sink, shared by all of its sessions.
///
/// [`ProgressChannel::send`] never blocks and never fails: the live stream
/// gets every message in order, the callback gets best-effort delivery until
/// its failure budget is spent.
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<Inner>,
}

impl ProgressChannel {
    #[must_use]
    pub fn new(agent: impl Into<String>, callback: Option<Callback>, tries: u32) -> Self {
        let (live, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                agent: agent.into(),
                live,
                next_id: AtomicU64::new(1),
                callback,
                tries: Arc::new(AtomicU32::new(tries)),
                on_close: Mutex::new(None),
            }),
        }
    }

    /// Attach a live listener, replacing any previous one, and greet it.
    pub fn attach(&self) -> ProgressListener {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ProgressMessage::agent_wide(ProgressEvent::Hello(true)));
        if let Some(previous) = self.inner.live.send_replace(Some(Live { id, tx })) {
            tracing::info!(agent = %self.inner.agent, listener = id, replaced = previous.id, "replaced live progress listener");
        } else {
            tracing::info!(agent = %self.inner.agent, listener = id, "live progress listener attached");
        }
        ProgressListener { id, rx }
    }

    pub fn detach(&self) {
        if self.inner.live.send_replace(None).is_some() {
            tracing::info!(agent = %self.inner.agent, "live progress listener detached");
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.live.borrow().as_ref().is_some_and(|live| !live.tx.is_closed())
    }

    #[must_use]
    pub fn remaining_callback_tries(&self) -> u32 {
        self.inner.tries.load(Ordering::SeqCst)
    }

    pub fn send(&self, message: ProgressMessage) {
        if let Some(live) = self.inner.live.borrow().as_ref() {
            if live.tx.send(message.clone()).is_err() {
                tracing::debug!(agent = %self.inner.agent, "live progress listener gone");
            }
        }

        let Some(callback) = self.inner.callback.clone() else { return };
        if self.remaining_callback_tries() == 0 {
            return;
        }
        let tries = Arc::clone(&self.inner.tries);
        let agent = self.inner.agent.clone();
        tokio::spawn(async move {
            let Err(err) = callback.client.deliver(&callback.url, &message).await else {
                return;
            };
            let previous = tries.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match previous {
                Ok(1) => tracing::error!(
                    %agent,
                    callback_url = %callback.url,
                    error = %err,
                    "progress callback failed too often, callback disabled"
                ),
                Ok(n) => tracing::warn!(
                    %agent,
                    callback_url = %callback.url,
                    tries = n - 1,
                    error = %err,
                    "progress callback failed"
                ),
                Err(_) => {}
            }
        });
    }

    /// Run `handler` when the live listener goes away.
    pub fn set_close_handler(&self, handler: impl FnOnce() + Send + 'static) {
        *self.close_slot() = Some(Box::new(handler));
    }

    pub fn clear_close_handler(&self) {
        self.close_slot().take();
    }

    /// The listener attached as `id` disconnected. A listener that has
    /// already been replaced leaves the current one and the close handler
    /// alone.
    pub fn closed(&self, id: u64) {
        let current = self.inner.live.send_if_modified(|live| {
            if live.as_ref().is_some_and(|live| live.id == id) {
                *live = None;
                true
            } else {
                false
            }
        });
        if !current {
            tracing::debug!(agent = %self.inner.agent, listener = id, "replaced progress listener closed");
            return;
        }
        tracing::info!(agent = %self.inner.agent, listener = id, "live progress listener detached");
        let handler = self.close_slot().take();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn close_slot(&self) -> std::sync::MutexGuard<'_, Option<CloseHandler>> {
        self.inner.on_close.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProgressChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressChannel")
            .field("agent", &self.inner.agent)
            .field("attached", &self.is_attached())
            .field("callback", &self.inner.callback)
            .field("tries", &self.remaining_callback_tries())
            .finish()
    }
}
