//! Telephony transports: the per-call event/verb channel and the endpoint
//! that yields new calls.

pub mod memory;
pub mod ws;

use crate::Result;
use crate::protocol::{CallCommand, CallEvent};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One live call on the telephony platform.
///
/// `next_event` must be cancel safe: the session polls it inside `select!`.
pub trait CallTransport: Send {
    fn send(&mut self, command: CallCommand) -> BoxFuture<'_, Result<()>>;
    /// `Ok(None)` once the call is gone.
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<CallEvent>>>;
}

/// A call announced by the platform, ready to be handed to a session.
pub struct IncomingCall {
    pub call_id: String,
    /// Caller identity, when the platform reports one.
    pub from: Option<String>,
    pub transport: Box<dyn CallTransport>,
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("call_id", &self.call_id)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

/// The inbound side of an agent: yields a new [`IncomingCall`] per call.
pub trait CallEndpoint: Send {
    /// Address callers (or the platform) use to reach this endpoint.
    fn address(&self) -> String;
    /// `Ok(None)` once the endpoint is shut down.
    fn accept(&mut self) -> BoxFuture<'_, Result<Option<IncomingCall>>>;
}
