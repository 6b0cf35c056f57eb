//! Typed telephony events and call-control verbs.
//!
//! The telephony platform is consumed as an event/verb API: a call delivers
//! [`CallEvent`]s and accepts batches of [`Verb`]s, either as the reply to the
//! hook currently being handled or as a queued command.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action hook the platform posts speech results to.
pub const PROMPT_HOOK: &str = "/prompt";
/// Action hook the platform posts recording notifications to.
pub const RECORD_HOOK: &str = "/record";

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Result of a `gather`: detected speech, a timeout or another outcome.
    Prompt(PromptEvent),
    Record(Value),
    /// Progress of a previously issued verb, correlated by its `id`.
    VerbStatus { id: Option<String>, event: String },
    Close { code: Option<u16>, reason: Option<String> },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PromptReason {
    SpeechDetected,
    Timeout,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptEvent {
    pub reason: PromptReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech: Option<SpeechResult>,
}

impl PromptEvent {
    #[must_use]
    pub fn speech(transcript: impl Into<String>) -> Self {
        Self {
            reason: PromptReason::SpeechDetected,
            speech: Some(SpeechResult {
                alternatives: vec![SpeechAlternative {
                    transcript: transcript.into(),
                    confidence: None,
                }],
            }),
        }
    }

    #[must_use]
    pub const fn timeout() -> Self {
        Self { reason: PromptReason::Timeout, speech: None }
    }

    /// The top transcript alternative, if the recognizer produced one.
    #[must_use]
    pub fn transcript(&self) -> Option<&str> {
        self.speech
            .as_ref()
            .and_then(|speech| speech.alternatives.first())
            .map(|alt| alt.transcript.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechResult {
    #[serde(default)]
    pub alternatives: Vec<SpeechAlternative>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechAlternative {
    pub transcript: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verb", rename_all = "camelCase")]
pub enum Verb {
    Config {
        #[serde(rename = "notifyEvents")]
        notify_events: bool,
    },
    Listen {
        url: String,
    },
    Say(Say),
    Gather(Gather),
    Pause {
        length: f32,
    },
    Hangup,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Say {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesizer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Gather {
    pub input: Vec<String>,
    pub action_hook: String,
    pub listen_during_prompt: bool,
    pub timeout: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognizer: Option<Recognizer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub say: Option<Say>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recognizer {
    pub vendor: String,
    pub language: String,
    #[serde(default)]
    pub hints: Vec<String>,
}

/// A batch of verbs and how it is delivered to the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum CallCommand {
    /// Queue the verbs on the call outside of any hook.
    Send(Vec<Verb>),
    /// Answer the hook currently being handled; an empty batch is a bare ack.
    Reply(Vec<Verb>),
}

impl CallCommand {
    #[must_use]
    pub fn verbs(&self) -> &[Verb] {
        match self {
            Self::Send(verbs) | Self::Reply(verbs) => verbs,
        }
    }

    #[must_use]
    pub fn hangs_up(&self) -> bool {
        self.verbs().iter().any(|verb| matches!(verb, Verb::Hangup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_serializes_with_camel_case_fields() {
        let verb = Verb::Gather(Gather {
            input: vec!["speech".to_string()],
            action_hook: PROMPT_HOOK.to_string(),
            listen_during_prompt: true,
            timeout: 20,
            recognizer: Some(Recognizer {
                vendor: "google".to_string(),
                language: "en-GB".to_string(),
                hints: vec!["Rome".to_string()],
            }),
            say: None,
        });
        let json = serde_json::to_value(&verb).unwrap();
        assert_eq!(json["verb"], "gather");
        assert_eq!(json["actionHook"], "/prompt");
        assert_eq!(json["listenDuringPrompt"], true);
        assert_eq!(json["recognizer"]["hints"][0], "Rome");
        assert!(json.get("say").is_none());
    }

    #[test]
    fn unknown_prompt_reason_maps_to_other() {
        let evt: PromptEvent = serde_json::from_str(r#"{"reason":"dtmfDetected"}"#).unwrap();
        assert_eq!(evt.reason, PromptReason::Other);
        assert!(evt.transcript().is_none());
    }

    #[test]
    fn transcript_takes_top_alternative() {
        let evt: PromptEvent = serde_json::from_str(
            r#"{"reason":"speechDetected","speech":{"alternatives":[{"transcript":"first","confidence":0.9},{"transcript":"second"}]}}"#,
        )
        .unwrap();
        assert_eq!(evt.transcript(), Some("first"));
    }
}
