#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod protocol;
pub mod transport;

pub use agent::{
    Agent, AgentBuilder, AgentDirectory, AgentInfo, AgentUpdate, Callback, CallbackClient,
    HttpCallback, Phase, ProgressChannel, ProgressListener, SessionHandle, SessionRegistry,
};
pub use config::{AgentOptions, SessionSettings};
pub use error::{ApiError, Error, Result};
pub use llm::{
    BackendFactory, Completion, Directive, Llm, LlmParams, ModelBackend, ModelContext, OpenAiChat,
    OpenAiFactory, ParsedText, RawCompletion,
};
pub use protocol::{
    CallCommand, CallEvent, FunctionCall, FunctionResult, FunctionSet, FunctionSpec, InboundMessage,
    ProgressEvent, ProgressMessage, PromptEvent, PromptReason, Verb,
};
pub use transport::{CallEndpoint, CallTransport, IncomingCall};
