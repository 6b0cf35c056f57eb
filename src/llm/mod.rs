//! Language-model adapter: a pluggable backend plus directive parsing.

pub mod directive;
pub mod openai;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::collections::HashSet;

use crate::config::AgentOptions;
use crate::protocol::{FunctionCall, FunctionResult, FunctionSet};
use crate::{Error, Result};

pub use directive::{Directive, ParsedText};
pub use openai::{OpenAiChat, OpenAiFactory};

/// Unparsed output of a backend request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCompletion {
    pub text: Option<String>,
    pub calls: Vec<FunctionCall>,
    pub error: Option<Value>,
}

impl RawCompletion {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Self::default() }
    }

    #[must_use]
    pub fn calls(calls: Vec<FunctionCall>) -> Self {
        Self { calls, ..Self::default() }
    }
}

/// Everything a backend sees of the adapter's state for one request.
#[derive(Debug, Clone, Copy)]
pub struct ModelContext<'a> {
    pub user: &'a str,
    pub prompt: &'a str,
    pub options: &'a AgentOptions,
    pub functions: Option<&'a FunctionSet>,
}

/// A concrete model API. One instance serves exactly one call and may keep
/// the conversation history.
#[async_trait]
pub trait ModelBackend: Send {
    fn supports_functions(&self) -> bool {
        false
    }

    /// Opening turn from the system prompt alone.
    async fn initial(&mut self, ctx: &ModelContext<'_>) -> Result<RawCompletion>;

    async fn completion(&mut self, ctx: &ModelContext<'_>, input: &str) -> Result<RawCompletion>;

    /// Continue the conversation with the results of previously issued calls.
    async fn call_result(
        &mut self,
        ctx: &ModelContext<'_>,
        results: &[FunctionResult],
    ) -> Result<RawCompletion> {
        let _ = (ctx, results);
        Err(Error::UnsupportedCapability("function calls"))
    }
}

/// Creates a fresh backend for every call an agent answers.
pub trait BackendFactory: Send + Sync {
    fn supports_functions(&self) -> bool;
    fn create(&self, user: &str) -> Box<dyn ModelBackend>;
}

/// A parsed model turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: Option<String>,
    pub data: Option<Value>,
    pub hangup: bool,
    pub calls: Vec<FunctionCall>,
    pub error: Option<Value>,
    pub directives: Vec<Directive>,
}

impl Completion {
    #[must_use]
    pub fn from_raw(raw: RawCompletion) -> Self {
        let RawCompletion { text, calls, error } = raw;
        let mut completion = Self { calls, error, ..Self::default() };
        if let Some(raw_text) = text.filter(|t| !t.is_empty()) {
            let parsed = directive::parse(&raw_text);
            completion.hangup = parsed.hangup();
            completion.data = parsed.data().cloned();
            completion.text = Some(parsed.text);
            completion.directives = parsed.directives;
        }
        completion
    }

    /// A plain spoken reply, used in place of a failed model request.
    #[must_use]
    pub fn apology(text: &str) -> Self {
        Self { text: Some(text.to_string()), ..Self::default() }
    }
}

pub struct LlmParams {
    /// Unique user id, normally the call id.
    pub user: String,
    pub prompt: String,
    pub functions: Option<FunctionSet>,
    pub options: AgentOptions,
}

/// Per-call model adapter. Exclusively owned by one session.
pub struct Llm {
    backend: Box<dyn ModelBackend>,
    user: String,
    initial_prompt: String,
    prompt: String,
    options: AgentOptions,
    functions: Option<FunctionSet>,
    hints: OnceCell<Vec<String>>,
}

impl Llm {
    /// # Errors
    /// Returns `UnsupportedCapability` if functions are supplied to a backend
    /// without function-call support.
    #[allow(clippy::result_large_err)]
    pub fn new(params: LlmParams, backend: Box<dyn ModelBackend>) -> Result<Self> {
        if params.functions.is_some() && !backend.supports_functions() {
            return Err(Error::UnsupportedCapability("functions not supported by this model"));
        }
        tracing::info!(user = %params.user, "model client created");
        Ok(Self {
            backend,
            user: params.user,
            initial_prompt: params.prompt.clone(),
            prompt: params.prompt,
            options: params.options,
            functions: params.functions,
            hints: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Replace the live prompt. Voice hints keep reflecting the initial prompt.
    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    #[must_use]
    pub const fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: AgentOptions) {
        self.options = options;
    }

    #[must_use]
    pub fn supports_functions(&self) -> bool {
        self.backend.supports_functions()
    }

    /// Unique words of the initial prompt, used to prime speech recognition.
    pub fn voice_hints(&self) -> &[String] {
        self.hints.get_or_init(|| derive_hints(&self.initial_prompt))
    }

    /// # Errors
    /// Returns an error if the backend request fails.
    pub async fn initial(&mut self) -> Result<Completion> {
        let ctx = ModelContext {
            user: &self.user,
            prompt: &self.prompt,
            options: &self.options,
            functions: self.functions.as_ref(),
        };
        let raw = self.backend.initial(&ctx).await?;
        Ok(self.finish(raw))
    }

    /// # Errors
    /// Returns an error if the backend request fails.
    pub async fn completion(&mut self, input: &str) -> Result<Completion> {
        let ctx = ModelContext {
            user: &self.user,
            prompt: &self.prompt,
            options: &self.options,
            functions: self.functions.as_ref(),
        };
        let raw = self.backend.completion(&ctx, input).await?;
        Ok(self.finish(raw))
    }

    /// # Errors
    /// Returns an error if the backend rejects or fails the resubmission.
    pub async fn call_result(&mut self, results: &[FunctionResult]) -> Result<Completion> {
        let ctx = ModelContext {
            user: &self.user,
            prompt: &self.prompt,
            options: &self.options,
            functions: self.functions.as_ref(),
        };
        let raw = self.backend.call_result(&ctx, results).await?;
        Ok(self.finish(raw))
    }

    fn finish(&self, raw: RawCompletion) -> Completion {
        tracing::debug!(user = %self.user, raw_text = ?raw.text, calls = raw.calls.len(), "completion received");
        Completion::from_raw(raw)
    }
}

fn derive_hints(prompt: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    prompt
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| word.len() > 2)
        .filter(|word| seen.insert(*word))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        functions: bool,
    }

    #[async_trait]
    impl ModelBackend for Echo {
        fn supports_functions(&self) -> bool {
            self.functions
        }

        async fn initial(&mut self, ctx: &ModelContext<'_>) -> Result<RawCompletion> {
            Ok(RawCompletion::text(ctx.prompt.to_string()))
        }

        async fn completion(&mut self, ctx: &ModelContext<'_>, input: &str) -> Result<RawCompletion> {
            Ok(RawCompletion::text(format!("{input} {}", ctx.prompt)))
        }
    }

    fn params(prompt: &str, functions: Option<FunctionSet>) -> LlmParams {
        LlmParams {
            user: "CA1".to_string(),
            prompt: prompt.to_string(),
            functions,
            options: AgentOptions::default(),
        }
    }

    #[test]
    fn voice_hints_are_unique_long_words() {
        let llm = Llm::new(params("Book a flight to Rome", None), Box::new(Echo { functions: false })).unwrap();
        assert_eq!(llm.voice_hints(), ["Book", "flight", "Rome"]);
    }

    #[test]
    fn voice_hints_survive_prompt_change() {
        let mut llm = Llm::new(
            params("Book a flight, book a flight to Rome", None),
            Box::new(Echo { functions: false }),
        )
        .unwrap();
        assert_eq!(llm.voice_hints(), ["Book", "flight", "book", "Rome"]);
        llm.set_prompt("Order pizza from Naples");
        assert_eq!(llm.prompt(), "Order pizza from Naples");
        assert_eq!(llm.voice_hints(), ["Book", "flight", "book", "Rome"]);
    }

    #[test]
    fn functions_need_backend_support() {
        let err = Llm::new(params("p", Some(FunctionSet::new())), Box::new(Echo { functions: false }))
            .err()
            .expect("construction fails");
        assert!(matches!(err, Error::UnsupportedCapability(_)));
        assert!(Llm::new(params("p", Some(FunctionSet::new())), Box::new(Echo { functions: true })).is_ok());
    }

    #[tokio::test]
    async fn completion_uses_live_prompt_and_parses_directives() {
        let mut llm = Llm::new(params("first", None), Box::new(Echo { functions: false })).unwrap();
        llm.set_prompt("second@HANGUP");
        let completion = llm.completion("hi").await.unwrap();
        assert!(completion.hangup);
        assert_eq!(completion.text.as_deref(), Some("hi second"));
    }

    #[tokio::test]
    async fn default_call_result_is_unsupported() {
        let mut llm = Llm::new(params("p", None), Box::new(Echo { functions: false })).unwrap();
        let err = llm.call_result(&[]).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedCapability(_)));
    }
}
