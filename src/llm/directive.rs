//! Inline `@NAME[: payload]` directives embedded in model output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static DIRECTIVE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([^@]*)@([A-Z][A-Z]+)(:\s*)?([^\n]*)?").expect("directive pattern is valid")
});

const STRONG_BREAK: &str = r#"<break strength="strong" />"#;
const MEDIUM_BREAK: &str = r#"<break strength="medium" />"#;

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `@HANGUP`: end the call after speaking.
    Hangup,
    /// `@DATA: {...}`: structured data for progress listeners.
    Data(Value),
    Unknown { name: String, value: Value },
}

impl Directive {
    fn from_parts(name: &str, value: Option<Value>) -> Self {
        match (name, value) {
            ("hangup", _) => Self::Hangup,
            ("data", value) => Self::Data(value.unwrap_or(Value::Bool(true))),
            (name, value) => Self::Unknown {
                name: name.to_string(),
                value: value.unwrap_or(Value::Bool(true)),
            },
        }
    }

    /// Lower-cased directive name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Hangup => "hangup",
            Self::Data(_) => "data",
            Self::Unknown { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedText {
    /// Speakable text with directives removed and newlines turned into breaks.
    pub text: String,
    pub directives: Vec<Directive>,
}

impl ParsedText {
    #[must_use]
    pub fn hangup(&self) -> bool {
        self.directives.iter().any(|d| matches!(d, Directive::Hangup))
    }

    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.directives.iter().find_map(|d| match d {
            Directive::Data(value) => Some(value),
            _ => None,
        })
    }

    fn record(&mut self, directive: Directive) {
        self.directives.retain(|d| d.name() != directive.name());
        self.directives.push(directive);
    }
}

/// Split raw model output into speakable text and directives.
///
/// Text after the last directive on the final line is not spoken.
#[must_use]
pub fn parse(raw: &str) -> ParsedText {
    let mut parsed = ParsedText::default();
    let mut found = false;

    for caps in DIRECTIVE_REGEX.captures_iter(raw) {
        found = true;
        if let Some(free) = caps.get(1) {
            parsed.text.push_str(free.as_str());
        }
        let Some(name) = caps.get(2) else { continue };
        let name = name.as_str().to_lowercase();
        let payload = caps
            .get(4)
            .map(|m| m.as_str())
            .filter(|payload| !payload.is_empty())
            .map(decode_payload);
        parsed.record(Directive::from_parts(&name, payload));
    }

    if !found {
        raw.clone_into(&mut parsed.text);
    }
    parsed.text = to_speech_breaks(&parsed.text);
    parsed
}

fn decode_payload(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|err| {
        tracing::error!(payload, error = %err, "directive payload is not valid JSON, keeping raw text");
        Value::String(payload.to_string())
    })
}

fn to_speech_breaks(text: &str) -> String {
    text.replace("\n\n", STRONG_BREAK).replace('\n', MEDIUM_BREAK)
}
