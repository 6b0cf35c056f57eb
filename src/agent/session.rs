//! Per-call conversation state machine.
//!
//! Each call runs as one task that owns the telephony transport and the
//! model adapter. The adapter is moved into the in-flight model request and
//! handed back with its result, so a session can never have two requests
//! outstanding.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::acks::AckRegistry;
use super::progress::ProgressChannel;
use super::registry::SessionRegistry;
use crate::config::{AgentOptions, SessionSettings};
use crate::llm::{Completion, Llm};
use crate::protocol::call::PROMPT_HOOK;
use crate::protocol::{
    CallCommand, CallEvent, FunctionCall, FunctionResult, Gather, ProgressEvent, ProgressMessage,
    PromptEvent, PromptReason, Recognizer, Say, Verb,
};
use crate::transport::{BoxFuture, CallTransport, IncomingCall};
use crate::{Error, Result};

pub const MODEL_APOLOGY: &str =
    "Sorry, I am having a bit of trouble at the moment. This is a me thing, not a you thing.";
pub const FUNCTION_APOLOGY: &str =
    "Sorry, I am having a bit of trouble getting the data you need at the moment. Lets try again...";
pub const EMPTY_REPLY: &str = "Sorry I seem to be having a problem at the moment";
pub const EMPTY_GREETING: &str = "Sorry I seem to be having an LLM problem at the moment";
pub const FORCE_CLOSE_GOODBYE: &str = "I'm sorry, I have to go now. Goodbye";
pub const TIMEOUT_GOODBYE: &str = "I'm struggling to understand, please try again later";
pub const UNREACHABLE_RESULT: &str = "Error: couldn't contact server";
pub const FUNCTION_TIMEOUT_RESULT: &str = "Error: function call timed out";

const GREETING_PAUSE_SECS: f32 = 0.5;

fn internal_issue(message: &str) -> String {
    format!("Sorry, I'm having some sort of internal issue, {message} please try again later")
}

/// Where a session is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Listening,
    Thinking,
    AwaitingFunctionResults,
    Responding,
    Closing,
    Closed,
}

enum Command {
    FunctionResults(Vec<FunctionResult>),
    ForceClose { respond: oneshot::Sender<()> },
    Inject { text: String, respond: oneshot::Sender<Result<()>> },
    SetOptions(AgentOptions),
    SetPrompt(String),
}

/// Entry points into a live session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    call_id: Arc<str>,
    sender: mpsc::Sender<Command>,
    phase: watch::Receiver<Phase>,
}

impl SessionHandle {
    #[must_use]
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Wait until the session loop has returned.
    pub async fn closed(&self) {
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|p| *p == Phase::Closed).await;
    }

    /// Hand the results of the outstanding function calls to the session.
    ///
    /// # Errors
    /// Returns `ConnectionClosed` if the session has ended.
    pub async fn deliver_function_results(&self, results: Vec<FunctionResult>) -> Result<()> {
        self.send(Command::FunctionResults(results)).await
    }

    /// Say goodbye, hang up and wait for the call to end.
    ///
    /// Returns immediately if the session has already ended.
    pub async fn force_close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::ForceClose { respond: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Speak `text` to the caller and listen for a response, outside of the
    /// normal turn cycle.
    ///
    /// # Errors
    /// Returns an error if the session has ended or the platform rejects the verbs.
    pub async fn inject(&self, text: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Inject { text: text.into(), respond: tx }).await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// # Errors
    /// Returns `ConnectionClosed` if the session has ended.
    pub async fn set_options(&self, options: AgentOptions) -> Result<()> {
        self.send(Command::SetOptions(options)).await
    }

    /// # Errors
    /// Returns `ConnectionClosed` if the session has ended.
    pub async fn set_prompt(&self, prompt: impl Into<String>) -> Result<()> {
        self.send(Command::SetPrompt(prompt.into())).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.sender.send(command).await.map_err(|_| Error::ConnectionClosed)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("call_id", &self.call_id)
            .field("phase", &self.phase())
            .finish()
    }
}

/// What a session needs from its agent.
#[derive(Clone, Debug)]
pub struct SessionSetup {
    pub settings: Arc<SessionSettings>,
    /// Target of the `listen` verb issued at call start.
    pub listen_url: String,
    pub options: AgentOptions,
    pub progress: ProgressChannel,
    pub registry: SessionRegistry,
}

/// Register a session for `call` and start its loop.
pub async fn spawn(call: IncomingCall, llm: Llm, setup: SessionSetup) -> SessionHandle {
    let IncomingCall { call_id, from, transport } = call;
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
    let (phase_tx, phase_rx) = watch::channel(Phase::Init);
    let handle = SessionHandle {
        call_id: Arc::from(call_id.as_str()),
        sender: cmd_tx,
        phase: phase_rx,
    };
    setup.registry.insert(handle.clone()).await;

    let synthesizer = setup.options.synthesizer(&setup.settings.synthesizer_vendor);
    let hints = llm.voice_hints().to_vec();
    let actor = SessionActor {
        call_id,
        from,
        settings: setup.settings,
        listen_url: setup.listen_url,
        options: setup.options,
        synthesizer,
        hints,
        progress: setup.progress,
        registry: setup.registry,
        transport,
        commands: cmd_rx,
        phase: phase_tx,
        llm: Some(llm),
        turn: None,
        turn_kind: TurnKind::Greeting,
        pending_options: None,
        pending_prompt: None,
        awaiting: None,
        closing: None,
        acks: AckRegistry::new(),
    };
    tracing::info!(call_id = %actor.call_id, from = ?actor.from, "session started");
    tokio::spawn(actor.run());
    handle
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    /// Opening turn, spoken after a short pause.
    Greeting,
    /// Answer to caller speech.
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Initial,
    Completion,
    CallResult,
}

enum Request {
    Initial,
    Completion(String),
    CallResult {
        results: Vec<FunctionResult>,
        /// Finishes once the interim speech has been played.
        interim: Option<oneshot::Receiver<()>>,
    },
}

struct ModelReply {
    llm: Llm,
    stage: Stage,
    result: Result<Completion>,
}

struct AwaitingResults {
    calls: Vec<FunctionCall>,
    interim: Option<oneshot::Receiver<()>>,
    deadline: Instant,
}

struct Closing {
    deadline: Instant,
    waiters: Vec<oneshot::Sender<()>>,
}

enum Step {
    Continue,
    Stop,
}

struct SessionActor {
    call_id: String,
    from: Option<String>,
    settings: Arc<SessionSettings>,
    listen_url: String,
    options: AgentOptions,
    synthesizer: Option<Value>,
    hints: Vec<String>,
    progress: ProgressChannel,
    registry: SessionRegistry,
    transport: Box<dyn CallTransport>,
    commands: mpsc::Receiver<Command>,
    phase: watch::Sender<Phase>,
    /// `None` while a model request is in flight.
    llm: Option<Llm>,
    turn: Option<BoxFuture<'static, ModelReply>>,
    turn_kind: TurnKind,
    pending_options: Option<AgentOptions>,
    pending_prompt: Option<String>,
    awaiting: Option<AwaitingResults>,
    closing: Option<Closing>,
    acks: AckRegistry,
}

impl SessionActor {
    async fn run(mut self) {
        match self.start().await {
            Ok(()) => loop {
                let results_deadline = self.awaiting.as_ref().map(|a| a.deadline);
                let close_deadline = self.closing.as_ref().map(|c| c.deadline);
                let step = tokio::select! {
                    reply = next_reply(&mut self.turn) => {
                        self.turn = None;
                        self.on_model_reply(reply).await
                    }
                    Some(cmd) = self.commands.recv() => self.on_command(cmd).await,
                    event = self.transport.next_event() => self.on_event(event).await,
                    () = sleep_until(results_deadline) => {
                        self.on_results_timeout();
                        Ok(Step::Continue)
                    }
                    () = sleep_until(close_deadline) => {
                        tracing::warn!(call_id = %self.call_id, "call did not close in time");
                        Ok(Step::Stop)
                    }
                };
                match step {
                    Ok(Step::Continue) => {}
                    Ok(Step::Stop) => break,
                    Err(err) => {
                        tracing::error!(call_id = %self.call_id, error = %err, "telephony transport failed");
                        self.abandon(&err).await;
                        break;
                    }
                }
            },
            Err(err) => {
                tracing::error!(call_id = %self.call_id, error = %err, "failed to start session");
                self.abandon(&err).await;
            }
        }
        self.finish().await;
    }

    async fn start(&mut self) -> Result<()> {
        self.transport
            .send(CallCommand::Send(vec![
                Verb::Config { notify_events: true },
                Verb::Listen { url: self.listen_url.clone() },
            ]))
            .await?;
        self.emit(ProgressEvent::Call(self.from.clone().unwrap_or_else(|| "unknown".to_string())));
        self.turn_kind = TurnKind::Greeting;
        self.dispatch(Request::Initial);
        Ok(())
    }

    /// Best-effort apology and hangup after the transport failed.
    async fn abandon(&mut self, err: &Error) {
        let apology = internal_issue(&err.to_string());
        self.emit(ProgressEvent::Goodbye(apology.clone()));
        let say = self.say(&apology, None);
        if let Err(err) = self
            .transport
            .send(CallCommand::Send(vec![Verb::Say(say), Verb::Hangup]))
            .await
        {
            tracing::debug!(call_id = %self.call_id, error = %err, "could not say goodbye");
        }
    }

    async fn finish(&mut self) {
        self.commands.close();
        self.emit(ProgressEvent::Hangup(true));
        self.registry.remove(&self.call_id).await;
        self.acks.cancel_all();
        self.turn = None;
        self.awaiting = None;
        self.set_phase(Phase::Closed);
        if let Some(closing) = self.closing.take() {
            for waiter in closing.waiters {
                let _ = waiter.send(());
            }
        }
        tracing::info!(call_id = %self.call_id, "session ended");
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(call_id = %self.call_id, ?previous, ?phase, "phase changed");
        }
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.send(ProgressMessage::for_call(self.call_id.clone(), event));
    }

    fn dispatch(&mut self, request: Request) {
        let Some(mut llm) = self.llm.take() else {
            tracing::error!(call_id = %self.call_id, "model request while another is in flight");
            return;
        };
        self.set_phase(Phase::Thinking);
        let call_id = self.call_id.clone();
        let ack_limit = self.settings.function_result_timeout();
        self.turn = Some(Box::pin(async move {
            let (stage, result) = match request {
                Request::Initial => (Stage::Initial, llm.initial().await),
                Request::Completion(input) => (Stage::Completion, llm.completion(&input).await),
                Request::CallResult { results, interim } => {
                    let result = llm.call_result(&results).await;
                    if let Some(interim) = interim {
                        if tokio::time::timeout(ack_limit, interim).await.is_err() {
                            tracing::warn!(%call_id, "interim speech never finished, continuing");
                        }
                    }
                    (Stage::CallResult, result)
                }
            };
            ModelReply { llm, stage, result }
        }));
    }

    async fn on_model_reply(&mut self, reply: ModelReply) -> Result<Step> {
        let ModelReply { mut llm, stage, result } = reply;
        if let Some(options) = self.pending_options.take() {
            llm.set_options(options);
        }
        if let Some(prompt) = self.pending_prompt.take() {
            llm.set_prompt(prompt);
        }
        self.llm = Some(llm);

        if self.closing.is_some() {
            tracing::debug!(call_id = %self.call_id, "dropping model reply, call is closing");
            return Ok(Step::Continue);
        }

        let completion = match result {
            Ok(completion) => completion,
            Err(err) if stage == Stage::CallResult => {
                tracing::error!(call_id = %self.call_id, error = %err, "function result resubmission failed");
                self.emit(ProgressEvent::Error(Value::String(err.to_string())));
                Completion::apology(FUNCTION_APOLOGY)
            }
            Err(err) => {
                tracing::error!(call_id = %self.call_id, error = %err, "model request failed");
                Completion::apology(MODEL_APOLOGY)
            }
        };
        self.on_completion(completion).await?;
        Ok(Step::Continue)
    }

    async fn on_completion(&mut self, completion: Completion) -> Result<()> {
        let Completion { text, data, hangup, calls, error, .. } = completion;
        let text = text.filter(|t| !t.is_empty());
        if let Some(text) = &text {
            self.emit(ProgressEvent::Agent(text.clone()));
        }
        if let Some(data) = data {
            self.emit(ProgressEvent::Data(data));
        }
        if let Some(error) = error {
            self.emit(ProgressEvent::Error(error));
        }

        if !calls.is_empty() {
            let interim = match text {
                Some(text) => {
                    let id = Uuid::new_v4().to_string();
                    let waiter = self.acks.register(Some(&id));
                    let say = self.say(&text, Some(id));
                    self.transport.send(CallCommand::Send(vec![Verb::Say(say)])).await?;
                    Some(waiter)
                }
                None => None,
            };
            self.request_function_results(calls, interim);
            return Ok(());
        }
        self.respond(text, hangup).await
    }

    fn request_function_results(&mut self, calls: Vec<FunctionCall>, interim: Option<oneshot::Receiver<()>>) {
        if !self.progress.is_attached() {
            tracing::warn!(call_id = %self.call_id, calls = calls.len(), "no progress listener to run function calls");
            let results = calls.iter().map(|call| call.failed(UNREACHABLE_RESULT)).collect();
            self.dispatch(Request::CallResult { results, interim });
            return;
        }
        self.emit(ProgressEvent::FunctionCalls(calls.clone()));
        self.awaiting = Some(AwaitingResults {
            calls,
            interim,
            deadline: Instant::now() + self.settings.function_result_timeout(),
        });
        self.set_phase(Phase::AwaitingFunctionResults);
    }

    fn on_function_results(&mut self, results: Vec<FunctionResult>) {
        let Some(awaiting) = self.awaiting.take() else {
            tracing::warn!(call_id = %self.call_id, "function results without outstanding calls, dropped");
            return;
        };
        tracing::debug!(call_id = %self.call_id, results = results.len(), "function results delivered");
        self.dispatch(Request::CallResult { results, interim: awaiting.interim });
    }

    fn on_results_timeout(&mut self) {
        let Some(awaiting) = self.awaiting.take() else { return };
        tracing::warn!(call_id = %self.call_id, calls = awaiting.calls.len(), "function results timed out");
        let results = awaiting
            .calls
            .iter()
            .map(|call| call.failed(FUNCTION_TIMEOUT_RESULT))
            .collect();
        self.dispatch(Request::CallResult { results, interim: awaiting.interim });
    }

    async fn respond(&mut self, text: Option<String>, hangup: bool) -> Result<()> {
        self.set_phase(Phase::Responding);
        let text = text.unwrap_or_else(|| {
            match self.turn_kind {
                TurnKind::Greeting => EMPTY_GREETING,
                TurnKind::Reply => EMPTY_REPLY,
            }
            .to_string()
        });

        let mut verbs = Vec::with_capacity(3);
        if self.turn_kind == TurnKind::Greeting {
            verbs.push(Verb::Pause { length: GREETING_PAUSE_SECS });
        }
        if hangup {
            verbs.push(Verb::Say(self.say(&text, None)));
            verbs.push(Verb::Hangup);
            self.transport.send(CallCommand::Send(verbs)).await?;
            self.begin_closing();
            return Ok(());
        }
        match self.turn_kind {
            TurnKind::Greeting => {
                verbs.push(Verb::Say(self.say(&text, None)));
                verbs.push(self.gather(None));
            }
            TurnKind::Reply => verbs.push(self.gather(Some(self.say(&text, None)))),
        }
        self.transport.send(CallCommand::Send(verbs)).await?;
        self.set_phase(Phase::Listening);
        Ok(())
    }

    fn begin_closing(&mut self) {
        self.turn = None;
        self.awaiting = None;
        if self.closing.is_none() {
            self.closing = Some(Closing {
                deadline: Instant::now() + self.settings.force_close_timeout(),
                waiters: Vec::new(),
            });
        }
        self.set_phase(Phase::Closing);
    }

    async fn on_command(&mut self, command: Command) -> Result<Step> {
        match command {
            Command::FunctionResults(results) => self.on_function_results(results),
            Command::ForceClose { respond } => {
                let already_closing = self.closing.is_some();
                self.begin_closing();
                if let Some(closing) = &mut self.closing {
                    closing.waiters.push(respond);
                }
                if !already_closing {
                    tracing::info!(call_id = %self.call_id, "force closing call");
                    self.emit(ProgressEvent::Goodbye(FORCE_CLOSE_GOODBYE.to_string()));
                    let say = self.say(FORCE_CLOSE_GOODBYE, None);
                    self.transport
                        .send(CallCommand::Send(vec![Verb::Say(say), Verb::Hangup]))
                        .await?;
                }
            }
            Command::Inject { text, respond } => {
                self.emit(ProgressEvent::Inject(text.clone()));
                let gather = self.gather(Some(self.say(&text, None)));
                match self.transport.send(CallCommand::Send(vec![gather])).await {
                    Ok(()) => {
                        let _ = respond.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = respond.send(Err(Error::Transport(err.to_string())));
                        return Err(err);
                    }
                }
            }
            Command::SetOptions(options) => {
                self.synthesizer = options.synthesizer(&self.settings.synthesizer_vendor);
                match &mut self.llm {
                    Some(llm) => llm.set_options(options.clone()),
                    None => self.pending_options = Some(options.clone()),
                }
                self.options = options;
            }
            Command::SetPrompt(prompt) => match &mut self.llm {
                Some(llm) => llm.set_prompt(prompt),
                None => self.pending_prompt = Some(prompt),
            },
        }
        Ok(Step::Continue)
    }

    async fn on_event(&mut self, event: Result<Option<CallEvent>>) -> Result<Step> {
        match event? {
            Some(CallEvent::Prompt(prompt)) => self.on_prompt(prompt).await?,
            Some(CallEvent::Record(data)) => {
                tracing::debug!(call_id = %self.call_id, %data, "recording event");
                self.transport.send(CallCommand::Reply(Vec::new())).await?;
            }
            Some(CallEvent::VerbStatus { id, event }) => {
                if let (Some(id), "finished") = (id, event.as_str()) {
                    self.acks.resolve(&id);
                }
            }
            Some(CallEvent::Close { code, reason }) => {
                tracing::info!(call_id = %self.call_id, ?code, ?reason, "call closed");
                return Ok(Step::Stop);
            }
            Some(CallEvent::Error { message }) => {
                tracing::error!(call_id = %self.call_id, %message, "telephony error");
                let apology = internal_issue(&message);
                self.emit(ProgressEvent::Goodbye(apology.clone()));
                let say = self.say(&apology, None);
                self.transport
                    .send(CallCommand::Send(vec![Verb::Say(say), Verb::Hangup]))
                    .await?;
                self.begin_closing();
            }
            None => {
                tracing::info!(call_id = %self.call_id, "telephony stream ended");
                return Ok(Step::Stop);
            }
        }
        Ok(Step::Continue)
    }

    async fn on_prompt(&mut self, prompt: PromptEvent) -> Result<()> {
        match prompt.reason {
            PromptReason::SpeechDetected => {
                self.transport.send(CallCommand::Reply(Vec::new())).await?;
                if self.phase() != Phase::Listening {
                    tracing::warn!(call_id = %self.call_id, phase = ?self.phase(), "speech while busy, dropped");
                    return Ok(());
                }
                let Some(transcript) = prompt.transcript().map(str::to_string) else {
                    tracing::warn!(call_id = %self.call_id, "speech result without a transcript");
                    let gather = self.gather(None);
                    return self.transport.send(CallCommand::Send(vec![gather])).await;
                };
                tracing::debug!(call_id = %self.call_id, %transcript, "caller spoke");
                self.emit(ProgressEvent::User(transcript.clone()));
                self.turn_kind = TurnKind::Reply;
                self.dispatch(Request::Completion(transcript));
            }
            PromptReason::Timeout => {
                self.emit(ProgressEvent::Goodbye(TIMEOUT_GOODBYE.to_string()));
                let say = self.say(TIMEOUT_GOODBYE, None);
                self.transport
                    .send(CallCommand::Reply(vec![Verb::Say(say), Verb::Hangup]))
                    .await?;
                self.begin_closing();
            }
            PromptReason::Other => {
                tracing::debug!(call_id = %self.call_id, "prompt without speech, acknowledged");
                self.transport.send(CallCommand::Reply(Vec::new())).await?;
            }
        }
        Ok(())
    }

    fn say(&self, text: &str, id: Option<String>) -> Say {
        Say {
            text: format!("<speak>{text}</speak>"),
            synthesizer: self.synthesizer.clone(),
            id,
        }
    }

    fn gather(&self, say: Option<Say>) -> Verb {
        let language = self
            .options
            .stt_language()
            .unwrap_or(&self.settings.language)
            .to_string();
        Verb::Gather(Gather {
            input: vec!["speech".to_string()],
            action_hook: PROMPT_HOOK.to_string(),
            listen_during_prompt: true,
            timeout: self.settings.gather_timeout_secs,
            recognizer: Some(Recognizer {
                vendor: self.settings.recognizer_vendor.clone(),
                language,
                hints: self.hints.clone(),
            }),
            say,
        })
    }
}

async fn next_reply(turn: &mut Option<BoxFuture<'static, ModelReply>>) -> ModelReply {
    match turn {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmParams, ModelBackend, ModelContext, RawCompletion};
    use crate::transport::memory::{self, CallPeer};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct Scripted {
        replies: VecDeque<RawCompletion>,
    }

    #[async_trait]
    impl ModelBackend for Scripted {
        async fn initial(&mut self, _ctx: &ModelContext<'_>) -> Result<RawCompletion> {
            Ok(self.replies.pop_front().unwrap_or_default())
        }

        async fn completion(&mut self, _ctx: &ModelContext<'_>, _input: &str) -> Result<RawCompletion> {
            self.replies
                .pop_front()
                .ok_or_else(|| Error::Transport("script exhausted".to_string()))
        }
    }

    async fn start(replies: &[&str]) -> (SessionHandle, CallPeer, SessionRegistry) {
        let (call, peer) = memory::call("CA1", Some("+441234"));
        let backend = Scripted { replies: replies.iter().map(|r| RawCompletion::text(*r)).collect() };
        let llm = Llm::new(
            LlmParams {
                user: "CA1".to_string(),
                prompt: "Book a flight to Rome".to_string(),
                functions: None,
                options: AgentOptions::default(),
            },
            Box::new(backend),
        )
        .unwrap();
        let registry = SessionRegistry::new();
        let setup = SessionSetup {
            settings: Arc::new(SessionSettings::default()),
            listen_url: "/agent/test".to_string(),
            options: AgentOptions::default(),
            progress: ProgressChannel::new("test", None, 6),
            registry: registry.clone(),
        };
        (spawn(call, llm, setup).await, peer, registry)
    }

    async fn next(peer: &mut CallPeer) -> CallCommand {
        tokio::time::timeout(Duration::from_secs(1), peer.next_command())
            .await
            .expect("command in time")
            .expect("session alive")
    }

    async fn wait_phase(handle: &SessionHandle, phase: Phase) {
        let mut rx = handle.phase.clone();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|p| *p == phase))
            .await
            .expect("phase reached")
            .unwrap();
    }

    #[tokio::test]
    async fn greeting_pauses_speaks_and_gathers() {
        let (handle, mut peer, _registry) = start(&["Hello there"]).await;

        let setup = next(&mut peer).await;
        assert_eq!(
            setup,
            CallCommand::Send(vec![
                Verb::Config { notify_events: true },
                Verb::Listen { url: "/agent/test".to_string() },
            ])
        );

        let CallCommand::Send(verbs) = next(&mut peer).await else { panic!("expected command") };
        assert_eq!(verbs[0], Verb::Pause { length: 0.5 });
        match &verbs[1] {
            Verb::Say(say) => assert_eq!(say.text, "<speak>Hello there</speak>"),
            other => panic!("unexpected verb: {other:?}"),
        }
        match &verbs[2] {
            Verb::Gather(gather) => {
                assert_eq!(gather.action_hook, PROMPT_HOOK);
                let hints = &gather.recognizer.as_ref().unwrap().hints;
                assert_eq!(hints, &["Book", "flight", "Rome"]);
            }
            other => panic!("unexpected verb: {other:?}"),
        }
        wait_phase(&handle, Phase::Listening).await;
    }

    #[tokio::test]
    async fn speech_is_acked_then_answered_in_gather() {
        let (handle, mut peer, _registry) = start(&["Hi", "Rome it is"]).await;
        next(&mut peer).await;
        next(&mut peer).await;
        wait_phase(&handle, Phase::Listening).await;

        peer.say("to Rome please").unwrap();
        assert_eq!(next(&mut peer).await, CallCommand::Reply(Vec::new()));
        let CallCommand::Send(verbs) = next(&mut peer).await else { panic!("expected command") };
        match &verbs[..] {
            [Verb::Gather(gather)] => {
                assert_eq!(gather.say.as_ref().unwrap().text, "<speak>Rome it is</speak>");
            }
            other => panic!("unexpected verbs: {other:?}"),
        }
    }

    #[tokio::test]
    async fn model_failure_is_replaced_by_apology() {
        let (handle, mut peer, _registry) = start(&["Hi"]).await;
        next(&mut peer).await;
        next(&mut peer).await;
        wait_phase(&handle, Phase::Listening).await;

        peer.say("anything").unwrap();
        next(&mut peer).await;
        let CallCommand::Send(verbs) = next(&mut peer).await else { panic!("expected command") };
        let Verb::Gather(gather) = &verbs[0] else { panic!("expected gather") };
        assert_eq!(gather.say.as_ref().unwrap().text, format!("<speak>{MODEL_APOLOGY}</speak>"));
    }

    #[tokio::test]
    async fn timeout_says_goodbye_and_hangs_up() {
        let (handle, mut peer, registry) = start(&["Hi"]).await;
        next(&mut peer).await;
        next(&mut peer).await;

        peer.emit(CallEvent::Prompt(PromptEvent::timeout())).unwrap();
        let reply = next(&mut peer).await;
        assert!(matches!(reply, CallCommand::Reply(_)));
        assert!(reply.hangs_up());
        wait_phase(&handle, Phase::Closing).await;

        peer.close().unwrap();
        wait_phase(&handle, Phase::Closed).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn inject_leaves_phase_alone() {
        let (handle, mut peer, _registry) = start(&["Hi"]).await;
        next(&mut peer).await;
        next(&mut peer).await;
        wait_phase(&handle, Phase::Listening).await;

        handle.inject("Your taxi has arrived").await.unwrap();
        let CallCommand::Send(verbs) = next(&mut peer).await else { panic!("expected command") };
        let Verb::Gather(gather) = &verbs[0] else { panic!("expected gather") };
        assert_eq!(gather.say.as_ref().unwrap().text, "<speak>Your taxi has arrived</speak>");
        assert_eq!(handle.phase(), Phase::Listening);
    }

    #[tokio::test]
    async fn force_close_waits_for_close_event() {
        let (handle, mut peer, registry) = start(&["Hi"]).await;
        next(&mut peer).await;
        next(&mut peer).await;

        let closer = handle.clone();
        let closing = tokio::spawn(async move { closer.force_close().await });
        let goodbye = next(&mut peer).await;
        assert!(goodbye.hangs_up());
        assert!(!closing.is_finished());

        peer.close().unwrap();
        tokio::time::timeout(Duration::from_secs(1), closing).await.unwrap().unwrap();
        assert_eq!(handle.phase(), Phase::Closed);
        assert!(registry.is_empty().await);
    }
}
