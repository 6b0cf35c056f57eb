//! WebSocket transports: telephony calls in, progress listeners out.
//!
//! Telephony frames are JSON objects tagged by `type`. Inbound
//! `session:new`, `verb:hook`, `verb:status` and `jambonz:error` frames are
//! mapped to [`CallEvent`]s; verbs go out as an `ack` of the pending hook or
//! as a `command` frame.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{BoxFuture, CallEndpoint, CallTransport, IncomingCall};
use crate::agent::Agent;
use crate::protocol::call::RECORD_HOOK;
use crate::protocol::{CallCommand, CallEvent, PromptEvent, PromptReason, Verb};
use crate::{Error, Result};

const SUBPROTOCOL: &str = "ws.jambonz.org";
const TRACE_LOG_MAX_BYTES: usize = 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const ACCEPT_BACKLOG: usize = 32;

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    msgid: Option<String>,
    call_sid: Option<String>,
    hook: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutboundFrame<'a> {
    Ack {
        msgid: String,
        data: &'a [Verb],
    },
    Command {
        command: &'static str,
        #[serde(rename = "queueCommand")]
        queue_command: bool,
        data: &'a [Verb],
    },
}

/// A telephony call carried over a WebSocket.
pub struct WsCallTransport<S> {
    stream: WebSocketStream<S>,
    /// `session:new` is answered by the first command the session sends.
    pending_new: Option<String>,
    /// The hook currently awaiting a reply.
    pending_hook: Option<String>,
}

impl<S> WsCallTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[must_use]
    pub const fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream, pending_new: None, pending_hook: None }
    }

    /// Wait for the `session:new` frame announcing the call.
    ///
    /// # Errors
    /// Returns an error if the socket fails or closes before the call is announced.
    pub async fn wait_for_session(&mut self) -> Result<(String, Option<String>)> {
        while let Some(msg) = self.stream.next().await {
            let Message::Text(text) = msg? else { continue };
            let frame: InboundFrame = serde_json::from_str(&text)?;
            if frame.kind != "session:new" {
                tracing::debug!(kind = %frame.kind, "ignoring frame before session:new");
                continue;
            }
            let call_id = frame
                .call_sid
                .ok_or_else(|| Error::MalformedMessage("session:new without call_sid".to_string()))?;
            let from = frame.data.get("from").and_then(Value::as_str).map(str::to_string);
            self.pending_new = frame.msgid;
            return Ok((call_id, from));
        }
        Err(Error::ConnectionClosed)
    }

    fn decode(&mut self, text: &str) -> Option<CallEvent> {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "malformed telephony frame");
                return None;
            }
        };
        match frame.kind.as_str() {
            "verb:hook" => {
                self.pending_hook = frame.msgid;
                if frame.hook.as_deref() == Some(RECORD_HOOK) {
                    return Some(CallEvent::Record(frame.data));
                }
                let prompt = serde_json::from_value(frame.data).unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "unreadable prompt payload");
                    PromptEvent { reason: PromptReason::Other, speech: None }
                });
                Some(CallEvent::Prompt(prompt))
            }
            "verb:status" => Some(CallEvent::VerbStatus {
                id: frame.data.get("id").and_then(Value::as_str).map(str::to_string),
                event: frame.data.get("event").and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            "jambonz:error" | "error" => Some(CallEvent::Error {
                message: frame
                    .data
                    .get("error")
                    .and_then(Value::as_str)
                    .map_or_else(|| frame.data.to_string(), str::to_string),
            }),
            other => {
                tracing::debug!(kind = other, "ignoring telephony frame");
                None
            }
        }
    }

    fn encode(&mut self, command: &CallCommand) -> Result<String> {
        let frame = match command {
            CallCommand::Reply(verbs) => match self.pending_hook.take().or_else(|| self.pending_new.take()) {
                Some(msgid) => OutboundFrame::Ack { msgid, data: verbs },
                None => {
                    tracing::warn!("reply without a pending hook, sending as command");
                    redirect(verbs)
                }
            },
            CallCommand::Send(verbs) => match self.pending_new.take() {
                Some(msgid) => OutboundFrame::Ack { msgid, data: verbs },
                None => redirect(verbs),
            },
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

const fn redirect(verbs: &[Verb]) -> OutboundFrame<'_> {
    OutboundFrame::Command { command: "redirect", queue_command: false, data: verbs }
}

fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

impl<S> CallTransport for WsCallTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send(&mut self, command: CallCommand) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let json = self.encode(&command)?;
            tracing::trace!("Sending frame: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
            self.stream.send(Message::Text(json.into())).await?;
            Ok(())
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<CallEvent>>> {
        Box::pin(async move {
            while let Some(msg) = self.stream.next().await {
                match msg? {
                    Message::Text(text) => {
                        tracing::trace!("Received frame: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                        if let Some(event) = self.decode(&text) {
                            return Ok(Some(event));
                        }
                    }
                    Message::Close(frame) => {
                        return Ok(Some(CallEvent::Close {
                            code: frame.as_ref().map(|f| u16::from(f.code)),
                            reason: frame.map(|f| f.reason.to_string()),
                        }));
                    }
                    Message::Ping(payload) => {
                        self.stream.send(Message::Pong(payload)).await?;
                    }
                    _ => (),
                }
            }
            Ok(None)
        })
    }
}

/// Accepts telephony WebSocket connections for one agent path.
///
/// Each connection is upgraded and waits for `session:new` on its own task,
/// bounded by the handshake timeout, so a stalled peer never holds up the
/// calls behind it.
pub struct WsCallEndpoint {
    calls: mpsc::Receiver<IncomingCall>,
    address: String,
    listener: AbortHandle,
}

impl WsCallEndpoint {
    /// Bind a listener serving calls on `path`.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(addr: &str, path: &str) -> Result<Self> {
        Self::bind_with_timeout(addr, path, HANDSHAKE_TIMEOUT).await
    }

    /// Like [`WsCallEndpoint::bind`], with a custom bound on the upgrade and
    /// `session:new` exchange.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub async fn bind_with_timeout(addr: &str, path: &str, handshake_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let address = format!("ws://{}{path}", listener.local_addr()?);
        tracing::info!(%address, "telephony endpoint listening");
        let (tx, calls) = mpsc::channel(ACCEPT_BACKLOG);
        let path: Arc<str> = Arc::from(path);
        let task = tokio::spawn(accept_loop(listener, path, handshake_timeout, tx));
        Ok(Self { calls, address, listener: task.abort_handle() })
    }
}

impl Drop for WsCallEndpoint {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn accept_loop(listener: TcpListener, path: Arc<str>, limit: Duration, calls: mpsc::Sender<IncomingCall>) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "telephony accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        if calls.is_closed() {
            break;
        }
        let path = Arc::clone(&path);
        let calls = calls.clone();
        tokio::spawn(async move {
            let call = match tokio::time::timeout(limit, handshake(tcp, &path)).await {
                Ok(Ok(call)) => call,
                Ok(Err(err)) => {
                    tracing::warn!(%peer, error = %err, "rejected telephony connection");
                    return;
                }
                Err(_) => {
                    let err = Error::Timeout("telephony handshake");
                    tracing::warn!(%peer, error = %err, "rejected telephony connection");
                    return;
                }
            };
            if calls.send(call).await.is_err() {
                tracing::debug!(%peer, "endpoint closed before call was handed over");
            }
        });
    }
}

async fn handshake(tcp: TcpStream, path: &str) -> Result<IncomingCall> {
    let expected = path.to_string();
    let callback = move |req: &Request, mut resp: Response| {
        if req.uri().path() != expected {
            let mut err = ErrorResponse::new(Some(format!("no agent at {}", req.uri().path())));
            *err.status_mut() = StatusCode::NOT_FOUND;
            return Err(err);
        }
        let wants_subprotocol = req
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|protocols| protocols.split(',').any(|p| p.trim() == SUBPROTOCOL));
        if wants_subprotocol {
            resp.headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        }
        Ok(resp)
    };
    let stream = tokio_tungstenite::accept_hdr_async(tcp, callback).await?;
    let mut transport = WsCallTransport::new(stream);
    let (call_id, from) = transport.wait_for_session().await?;
    Ok(IncomingCall { call_id, from, transport: Box::new(transport) })
}

impl CallEndpoint for WsCallEndpoint {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn accept(&mut self) -> BoxFuture<'_, Result<Option<IncomingCall>>> {
        Box::pin(async move { Ok(self.calls.recv().await) })
    }
}

/// Pump an agent's progress stream over a WebSocket until either side closes.
///
/// Outbound progress messages are written as JSON text frames; inbound text
/// frames are routed to the agent's sessions.
pub async fn serve_progress<S>(mut stream: WebSocketStream<S>, agent: &Agent)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut progress = agent.attach_progress();
    loop {
        tokio::select! {
            msg = progress.recv() => {
                let Some(msg) = msg else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to encode progress message");
                        continue;
                    }
                };
                if let Err(err) = stream.send(Message::Text(json.into())).await {
                    tracing::error!(error = %err, "progress socket send failed");
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => agent.handle_progress_message(&text).await,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = stream.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "received progress socket error");
                        break;
                    }
                }
            }
        }
    }
    let id = progress.id();
    drop(progress);
    agent.progress_closed(id);
}
