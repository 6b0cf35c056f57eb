use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::functions::{FunctionCall, FunctionResult};

/// A normalized conversation event as seen by progress listeners.
///
/// Serialized externally tagged, so `User("hi")` becomes `{"user":"hi"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEvent {
    Hello(bool),
    /// A call started; carries the caller identity.
    Call(String),
    User(String),
    Agent(String),
    Data(Value),
    Error(Value),
    FunctionCalls(Vec<FunctionCall>),
    Goodbye(String),
    Hangup(bool),
    Inject(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressMessage {
    #[serde(flatten)]
    pub event: ProgressEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl ProgressMessage {
    #[must_use]
    pub const fn agent_wide(event: ProgressEvent) -> Self {
        Self { event, call_id: None }
    }

    #[must_use]
    pub fn for_call(call_id: impl Into<String>, event: ProgressEvent) -> Self {
        Self { event, call_id: Some(call_id.into()) }
    }
}

/// A message received from a progress listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_results: Option<Vec<FunctionResult>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_scoped_message_is_flat() {
        let msg = ProgressMessage::for_call("CA123", ProgressEvent::User("hello".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({ "user": "hello", "call_id": "CA123" }));
    }

    #[test]
    fn hangup_is_boolean_flag() {
        let msg = ProgressMessage::for_call("CA1", ProgressEvent::Hangup(true));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["hangup"], true);
    }

    #[test]
    fn inbound_message_without_results_parses() {
        let msg: InboundMessage = serde_json::from_str(r#"{"call_id":"CA9"}"#).unwrap();
        assert_eq!(msg.call_id, "CA9");
        assert!(msg.function_results.is_none());
    }
}
