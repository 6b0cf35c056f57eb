use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{BackendFactory, ModelBackend, ModelContext, RawCompletion};
use crate::error::{ApiError, Error, Result};
use crate::protocol::{FunctionCall, FunctionResult};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

const BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self { role, content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ChatFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatFunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as produced by the model.
    pub arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    user: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

/// Chat-completions backend for OpenAI-compatible endpoints.
///
/// Keeps the per-call history; the system message is rebuilt from the live
/// prompt on every request.
pub struct OpenAiChat {
    client: Client,
    auth_header: HeaderValue,
    base_url: String,
    model: String,
    history: Vec<ChatMessage>,
}

impl OpenAiChat {
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new(api_key: &str, model: impl Into<String>) -> Result<Self> {
        let factory = OpenAiFactory::new(api_key, model)?;
        Ok(factory.backend())
    }

    #[must_use]
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    fn build_request(&self, ctx: &ModelContext<'_>) -> ChatRequest {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::new(ChatRole::System, ctx.prompt));
        messages.extend(self.history.iter().cloned());
        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: ctx.options.temperature(),
            tools: ctx.functions.filter(|f| !f.is_empty()).map(crate::protocol::FunctionSet::as_tools),
            user: ctx.user.to_string(),
        }
    }

    async fn request(&mut self, ctx: &ModelContext<'_>) -> Result<RawCompletion> {
        let body = self.build_request(ctx);
        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(AUTHORIZATION, &self.auth_header)
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await?;
            return Err(match serde_json::from_str::<ErrorEnvelope>(&text) {
                Ok(envelope) => Error::Api(envelope.error),
                Err(_) => Error::Api(ApiError {
                    error_type: None,
                    code: Some(status.as_str().to_string()),
                    message: text,
                    param: None,
                }),
            });
        }

        let reply: ChatResponse = res.json().await?;
        let message = reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| Error::MalformedMessage("completion has no choices".to_string()))?;
        let completion = completion_from_message(&message);
        self.history.push(message);
        Ok(completion)
    }
}

fn completion_from_message(message: &ChatMessage) -> RawCompletion {
    let calls = message
        .tool_calls
        .iter()
        .flatten()
        .map(|call| FunctionCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input: serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| Value::String(call.function.arguments.clone())),
        })
        .collect();
    RawCompletion { text: message.content.clone(), calls, error: None }
}

fn result_message(result: &FunctionResult) -> ChatMessage {
    let content = match &result.result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    ChatMessage {
        role: ChatRole::Tool,
        content: Some(content),
        tool_calls: None,
        tool_call_id: Some(result.id.clone()),
    }
}

#[async_trait]
impl ModelBackend for OpenAiChat {
    fn supports_functions(&self) -> bool {
        true
    }

    async fn initial(&mut self, ctx: &ModelContext<'_>) -> Result<RawCompletion> {
        self.request(ctx).await
    }

    async fn completion(&mut self, ctx: &ModelContext<'_>, input: &str) -> Result<RawCompletion> {
        self.history.push(ChatMessage::new(ChatRole::User, input));
        self.request(ctx).await
    }

    async fn call_result(
        &mut self,
        ctx: &ModelContext<'_>,
        results: &[FunctionResult],
    ) -> Result<RawCompletion> {
        self.history.extend(results.iter().map(result_message));
        self.request(ctx).await
    }
}

/// Builds one [`OpenAiChat`] per call, sharing the HTTP connection pool.
#[derive(Clone, Debug)]
pub struct OpenAiFactory {
    client: Client,
    auth_header: HeaderValue,
    base_url: String,
    model: String,
}

impl OpenAiFactory {
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new(api_key: &str, model: impl Into<String>) -> Result<Self> {
        Self::new_with_timeouts(api_key, model, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        api_key: &str,
        model: impl Into<String>,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;
        let auth_header = HeaderValue::from_str(&format!("Bearer {api_key}"))?;
        Ok(Self {
            client,
            auth_header,
            base_url: BASE_URL.to_string(),
            model: model.into(),
        })
    }

    /// Point at another OpenAI-compatible endpoint.
    ///
    /// # Errors
    /// Returns an error if `base_url` is not a valid URL.
    #[allow(clippy::result_large_err)]
    pub fn base_url(mut self, base_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(base_url)?;
        self.base_url = parsed.as_str().trim_end_matches('/').to_string();
        Ok(self)
    }

    fn backend(&self) -> OpenAiChat {
        OpenAiChat {
            client: self.client.clone(),
            auth_header: self.auth_header.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            history: Vec::new(),
        }
    }
}

impl BackendFactory for OpenAiFactory {
    fn supports_functions(&self) -> bool {
        true
    }

    fn create(&self, _user: &str) -> Box<dyn ModelBackend> {
        Box::new(self.backend())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentOptions;
    use crate::protocol::{FunctionSet, FunctionSpec};
    use serde_json::json;

    #[test]
    fn request_carries_live_prompt_tools_and_temperature() {
        let chat = OpenAiChat::new("sk-test", "gpt-4").unwrap();
        let options: AgentOptions = serde_json::from_value(json!({ "temperature": 0.3 })).unwrap();
        let functions: FunctionSet = std::iter::once(FunctionSpec {
            name: "lookup".to_string(),
            description: None,
            parameters: json!({ "type": "object" }),
        })
        .collect();
        let ctx = ModelContext {
            user: "CA1",
            prompt: "You are a travel agent",
            options: &options,
            functions: Some(&functions),
        };

        let body = serde_json::to_value(chat.build_request(&ctx)).unwrap();
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["messages"][0], json!({ "role": "system", "content": "You are a travel agent" }));
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
        assert_eq!(body["user"], "CA1");
    }

    #[test]
    fn empty_function_set_sends_no_tools() {
        let chat = OpenAiChat::new("sk-test", DEFAULT_MODEL).unwrap();
        let options = AgentOptions::default();
        let functions = FunctionSet::new();
        let ctx = ModelContext { user: "u", prompt: "p", options: &options, functions: Some(&functions) };
        let body = serde_json::to_value(chat.build_request(&ctx)).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn tool_calls_map_to_function_calls() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": "Let me check.",
            "tool_calls": [
                { "id": "call_1", "type": "function", "function": { "name": "weather", "arguments": "{\"city\":\"Rome\"}" } },
                { "id": "call_2", "type": "function", "function": { "name": "raw", "arguments": "not json" } }
            ]
        }))
        .unwrap();

        let raw = completion_from_message(&message);
        assert_eq!(raw.text.as_deref(), Some("Let me check."));
        assert_eq!(raw.calls.len(), 2);
        assert_eq!(raw.calls[0].input, json!({ "city": "Rome" }));
        assert_eq!(raw.calls[1].input, json!("not json"));
    }

    #[test]
    fn results_become_tool_messages() {
        let result = FunctionResult {
            id: "call_1".to_string(),
            name: "weather".to_string(),
            input: Value::Null,
            result: json!({ "temp": 21 }),
        };
        let message = result_message(&result);
        assert_eq!(message.role, ChatRole::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(message.content.as_deref(), Some(r#"{"temp":21}"#));
    }
}
