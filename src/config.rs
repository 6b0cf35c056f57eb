use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Number of failed progress callbacks tolerated before an agent stops trying.
pub const DEFAULT_CALLBACK_TRIES: u32 = 6;

const DEFAULT_VENDOR: &str = "google";
const DEFAULT_LANGUAGE: &str = "en-GB";

fn default_vendor() -> String {
    DEFAULT_VENDOR.to_string()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

const fn default_gather_timeout_secs() -> u32 {
    20
}

const fn default_function_result_timeout_secs() -> u64 {
    30
}

const fn default_force_close_timeout_secs() -> u64 {
    10
}

const fn default_callback_tries() -> u32 {
    DEFAULT_CALLBACK_TRIES
}

/// Per-agent tuning shared by every session the agent spawns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    /// Seconds the platform waits for speech before reporting a timeout.
    #[serde(default = "default_gather_timeout_secs")]
    pub gather_timeout_secs: u32,
    #[serde(default = "default_vendor")]
    pub recognizer_vendor: String,
    /// Used when the options carry no `stt.language`.
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_vendor")]
    pub synthesizer_vendor: String,
    /// Upper bound on waiting for externally delivered function results.
    #[serde(default = "default_function_result_timeout_secs")]
    pub function_result_timeout_secs: u64,
    /// Upper bound on waiting for the close event after a forced hangup.
    #[serde(default = "default_force_close_timeout_secs")]
    pub force_close_timeout_secs: u64,
    #[serde(default = "default_callback_tries")]
    pub callback_tries: u32,
}

impl SessionSettings {
    #[must_use]
    pub const fn function_result_timeout(&self) -> Duration {
        Duration::from_secs(self.function_result_timeout_secs)
    }

    #[must_use]
    pub const fn force_close_timeout(&self) -> Duration {
        Duration::from_secs(self.force_close_timeout_secs)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            gather_timeout_secs: default_gather_timeout_secs(),
            recognizer_vendor: default_vendor(),
            language: default_language(),
            synthesizer_vendor: default_vendor(),
            function_result_timeout_secs: default_function_result_timeout_secs(),
            force_close_timeout_secs: default_force_close_timeout_secs(),
            callback_tries: default_callback_tries(),
        }
    }
}

/// Combined speech and model options for an agent.
///
/// TTS and STT shapes are vendor specific and carried as opaque JSON; every
/// other key (e.g. `temperature`) is handed to the model backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stt: Option<Value>,
    #[serde(flatten)]
    pub model: Map<String, Value>,
}

impl AgentOptions {
    /// Shallow merge: keys present in `update` replace the current ones.
    #[must_use]
    pub fn merged(&self, update: &Self) -> Self {
        let mut model = self.model.clone();
        model.extend(update.model.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            tts: update.tts.clone().or_else(|| self.tts.clone()),
            stt: update.stt.clone().or_else(|| self.stt.clone()),
            model,
        }
    }

    /// Synthesizer settings for `say` verbs, present only when TTS options are.
    #[must_use]
    pub fn synthesizer(&self, default_vendor: &str) -> Option<Value> {
        let tts = self.tts.as_ref()?;
        let mut synthesizer = Map::new();
        synthesizer.insert("vendor".to_string(), Value::String(default_vendor.to_string()));
        match tts {
            Value::Object(fields) => {
                synthesizer.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            other => {
                tracing::warn!(tts = %other, "ignoring non-object tts options");
            }
        }
        Some(Value::Object(synthesizer))
    }

    /// Recognition language from `stt.language`, if configured.
    #[must_use]
    pub fn stt_language(&self) -> Option<&str> {
        self.stt.as_ref()?.get("language")?.as_str()
    }

    #[must_use]
    pub fn temperature(&self) -> Option<f64> {
        self.model.get("temperature").and_then(Value::as_f64)
    }
}
