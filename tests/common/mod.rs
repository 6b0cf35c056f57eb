#![allow(dead_code)]

use async_trait::async_trait;
use llm_call_rs::agent::session::{self, SessionSetup};
use llm_call_rs::transport::IncomingCall;
use llm_call_rs::transport::memory::{self, CallPeer};
use llm_call_rs::{
    AgentOptions, BackendFactory, CallCommand, Error, FunctionCall, FunctionResult, Llm, LlmParams,
    ModelBackend, ModelContext, Phase, ProgressChannel, RawCompletion, Result, SessionHandle,
    SessionRegistry, SessionSettings,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A request a scripted backend received.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Initial,
    Completion(String),
    CallResult(Vec<FunctionResult>),
}

/// Replies shared by every backend a [`ScriptedFactory`] creates. `None`
/// makes the request fail.
#[derive(Clone, Default)]
pub struct Script {
    replies: Arc<Mutex<VecDeque<Option<RawCompletion>>>>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.replies.lock().unwrap().push_back(Some(RawCompletion::text(text)));
        self
    }

    pub fn calls(self, text: Option<&str>, calls: Vec<FunctionCall>) -> Self {
        let raw = RawCompletion { text: text.map(str::to_string), calls, error: None };
        self.replies.lock().unwrap().push_back(Some(raw));
        self
    }

    pub fn fail(self) -> Self {
        self.replies.lock().unwrap().push_back(None);
        self
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn call_results(&self) -> Vec<Vec<FunctionResult>> {
        self.seen()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::CallResult(results) => Some(results),
                _ => None,
            })
            .collect()
    }

    fn next(&self, seen: Seen) -> Result<RawCompletion> {
        self.seen.lock().unwrap().push(seen);
        match self.replies.lock().unwrap().pop_front() {
            Some(Some(raw)) => Ok(raw),
            Some(None) => Err(Error::Transport("scripted failure".to_string())),
            None => Err(Error::Transport("script exhausted".to_string())),
        }
    }
}

pub struct ScriptedBackend {
    script: Script,
    functions: bool,
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn supports_functions(&self) -> bool {
        self.functions
    }

    async fn initial(&mut self, _ctx: &ModelContext<'_>) -> Result<RawCompletion> {
        self.script.next(Seen::Initial)
    }

    async fn completion(&mut self, _ctx: &ModelContext<'_>, input: &str) -> Result<RawCompletion> {
        self.script.next(Seen::Completion(input.to_string()))
    }

    async fn call_result(&mut self, _ctx: &ModelContext<'_>, results: &[FunctionResult]) -> Result<RawCompletion> {
        self.script.next(Seen::CallResult(results.to_vec()))
    }
}

pub struct ScriptedFactory {
    pub script: Script,
    pub functions: bool,
}

impl BackendFactory for ScriptedFactory {
    fn supports_functions(&self) -> bool {
        self.functions
    }

    fn create(&self, _user: &str) -> Box<dyn ModelBackend> {
        Box::new(ScriptedBackend { script: self.script.clone(), functions: self.functions })
    }
}

pub fn call(id: &str, name: &str) -> FunctionCall {
    FunctionCall { id: id.to_string(), name: name.to_string(), input: serde_json::json!({}) }
}

pub struct Harness {
    pub handle: SessionHandle,
    pub peer: CallPeer,
    pub registry: SessionRegistry,
    pub progress: ProgressChannel,
}

pub async fn start_session(script: &Script, progress: ProgressChannel, settings: SessionSettings) -> Harness {
    let (incoming, peer) = memory::call("CA1", Some("+441234"));
    let (handle, registry) = spawn_session(script, incoming, progress.clone(), settings).await;
    Harness { handle, peer, registry, progress }
}

/// Spawn a session for `incoming` backed by `script`.
pub async fn spawn_session(
    script: &Script,
    incoming: IncomingCall,
    progress: ProgressChannel,
    settings: SessionSettings,
) -> (SessionHandle, SessionRegistry) {
    let llm = Llm::new(
        LlmParams {
            user: "CA1".to_string(),
            prompt: "Book a flight to Rome".to_string(),
            functions: None,
            options: AgentOptions::default(),
        },
        Box::new(ScriptedBackend { script: script.clone(), functions: true }),
    )
    .unwrap();
    let registry = SessionRegistry::new();
    let setup = SessionSetup {
        settings: Arc::new(settings),
        listen_url: "/agent/test".to_string(),
        options: AgentOptions::default(),
        progress,
        registry: registry.clone(),
    };
    (session::spawn(incoming, llm, setup).await, registry)
}

pub async fn next_command(peer: &mut CallPeer) -> CallCommand {
    tokio::time::timeout(Duration::from_secs(3), peer.next_command())
        .await
        .expect("command in time")
        .expect("session alive")
}

pub async fn wait_for_phase(handle: &SessionHandle, phase: Phase) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while handle.phase() != phase {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {phase:?}, stuck in {:?}", handle.phase()));
}

pub async fn wait_until<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}
