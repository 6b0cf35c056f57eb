//! In-process telephony transport.
//!
//! The [`CallPeer`] half plays the platform: it emits [`CallEvent`]s and
//! observes the [`CallCommand`]s a session issues.

use tokio::sync::mpsc;

use super::{BoxFuture, CallEndpoint, CallTransport, IncomingCall};
use crate::protocol::{CallCommand, CallEvent, PromptEvent};
use crate::{Error, Result};

pub struct MemoryTransport {
    events: mpsc::UnboundedReceiver<CallEvent>,
    commands: mpsc::UnboundedSender<CallCommand>,
}

impl CallTransport for MemoryTransport {
    fn send(&mut self, command: CallCommand) -> BoxFuture<'_, Result<()>> {
        let result = self.commands.send(command).map_err(|_| Error::ConnectionClosed);
        Box::pin(async move { result })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<CallEvent>>> {
        Box::pin(async move { Ok(self.events.recv().await) })
    }
}

/// Platform side of an in-memory call.
pub struct CallPeer {
    call_id: String,
    events: mpsc::UnboundedSender<CallEvent>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
}

impl CallPeer {
    #[must_use]
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// # Errors
    /// Returns an error if the session side has gone away.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: CallEvent) -> Result<()> {
        self.events.send(event).map_err(|_| Error::ConnectionClosed)
    }

    /// Deliver a recognized utterance.
    ///
    /// # Errors
    /// Returns an error if the session side has gone away.
    #[allow(clippy::result_large_err)]
    pub fn say(&self, transcript: &str) -> Result<()> {
        self.emit(CallEvent::Prompt(PromptEvent::speech(transcript)))
    }

    /// # Errors
    /// Returns an error if the session side has gone away.
    #[allow(clippy::result_large_err)]
    pub fn close(&self) -> Result<()> {
        self.emit(CallEvent::Close { code: Some(1000), reason: None })
    }

    /// Next command issued by the session; `None` once it dropped the call.
    pub async fn next_command(&mut self) -> Option<CallCommand> {
        self.commands.recv().await
    }
}

/// Create a connected call: the session-facing [`IncomingCall`] and its peer.
#[must_use]
pub fn call(call_id: &str, from: Option<&str>) -> (IncomingCall, CallPeer) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let incoming = IncomingCall {
        call_id: call_id.to_string(),
        from: from.map(str::to_string),
        transport: Box::new(MemoryTransport { events: event_rx, commands: command_tx }),
    };
    let peer = CallPeer {
        call_id: call_id.to_string(),
        events: event_tx,
        commands: command_rx,
    };
    (incoming, peer)
}

pub struct MemoryEndpoint {
    address: String,
    incoming: mpsc::UnboundedReceiver<IncomingCall>,
}

impl CallEndpoint for MemoryEndpoint {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn accept(&mut self) -> BoxFuture<'_, Result<Option<IncomingCall>>> {
        Box::pin(async move { Ok(self.incoming.recv().await) })
    }
}

/// Places calls into a [`MemoryEndpoint`].
#[derive(Clone)]
pub struct Dialer {
    incoming: mpsc::UnboundedSender<IncomingCall>,
}

impl Dialer {
    /// # Errors
    /// Returns an error if the endpoint has been shut down.
    #[allow(clippy::result_large_err)]
    pub fn dial(&self, call_id: &str, from: Option<&str>) -> Result<CallPeer> {
        let (incoming, peer) = call(call_id, from);
        self.incoming.send(incoming).map_err(|_| Error::ConnectionClosed)?;
        Ok(peer)
    }
}

#[must_use]
pub fn endpoint(address: impl Into<String>) -> (MemoryEndpoint, Dialer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryEndpoint { address: address.into(), incoming: rx }, Dialer { incoming: tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Verb;

    #[tokio::test]
    async fn commands_reach_peer_and_events_reach_transport() {
        let (mut incoming, mut peer) = call("CA1", Some("+441234"));
        incoming
            .transport
            .send(CallCommand::Send(vec![Verb::Hangup]))
            .await
            .unwrap();
        assert_eq!(peer.next_command().await, Some(CallCommand::Send(vec![Verb::Hangup])));

        peer.say("hello").unwrap();
        match incoming.transport.next_event().await.unwrap() {
            Some(CallEvent::Prompt(evt)) => assert_eq!(evt.transcript(), Some("hello")),
            other => panic!("unexpected event: {other:?}"),
        }

        drop(peer);
        assert!(incoming.transport.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dialed_calls_are_accepted() {
        let (mut endpoint, dialer) = endpoint("memory://agent/test");
        let _peer = dialer.dial("CA7", None).unwrap();
        let call = endpoint.accept().await.unwrap().expect("incoming call");
        assert_eq!(call.call_id, "CA7");
        assert_eq!(endpoint.address(), "memory://agent/test");
    }
}
