use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// A model-requested side effect that an external actor must resolve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    /// Decoded arguments; the raw string when the model produced invalid JSON.
    #[serde(default)]
    pub input: Value,
}

impl FunctionCall {
    /// Build the failure result reported back to the model when the call
    /// could not be executed.
    #[must_use]
    pub fn failed(&self, reason: &str) -> FunctionResult {
        FunctionResult {
            id: self.id.clone(),
            name: self.name.clone(),
            input: self.input.clone(),
            result: Value::String(reason.to_string()),
        }
    }
}

/// The outcome of a [`FunctionCall`], delivered back through the progress channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResult {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Value,
    pub result: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the call input (intentionally untyped).
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// The set of functions an agent exposes to its model.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct FunctionSet {
    specs: Vec<FunctionSpec>,
}

impl FunctionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn definitions(&self) -> &[FunctionSpec] {
        &self.specs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Register a function whose input schema is derived from `TArgs`.
    ///
    /// # Errors
    /// Returns an error if the generated schema cannot be serialized.
    // Keep a single public error type for the crate surface.
    #[allow(clippy::result_large_err)]
    pub fn function<TArgs>(&mut self, name: &str, description: impl Into<String>) -> Result<()>
    where
        TArgs: JsonSchema,
    {
        let schema = schemars::schema_for!(TArgs);
        let parameters = serde_json::to_value(&schema)?;
        self.push(FunctionSpec {
            name: name.to_string(),
            description: Some(description.into()),
            parameters,
        });
        Ok(())
    }

    /// Register a function with a hand-written schema. A later spec with the
    /// same name replaces the earlier one.
    pub fn push(&mut self, spec: FunctionSpec) {
        self.specs.retain(|existing| existing.name != spec.name);
        self.specs.push(spec);
    }

    /// Render the set as chat-completion `tools` entries.
    #[must_use]
    pub fn as_tools(&self) -> Vec<Value> {
        self.specs
            .iter()
            .map(|spec| {
                let mut function = serde_json::json!({
                    "name": spec.name,
                    "parameters": spec.parameters,
                });
                if let Some(description) = &spec.description {
                    function["description"] = Value::String(description.clone());
                }
                serde_json::json!({ "type": "function", "function": function })
            })
            .collect()
    }
}

impl FromIterator<FunctionSpec> for FunctionSet {
    fn from_iter<I: IntoIterator<Item = FunctionSpec>>(iter: I) -> Self {
        let mut set = Self::new();
        for spec in iter {
            set.push(spec);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(JsonSchema)]
    #[allow(dead_code)]
    struct BookingArgs {
        destination: String,
        passengers: u32,
    }

    #[test]
    fn typed_function_renders_tool_entry() {
        let mut set = FunctionSet::new();
        set.function::<BookingArgs>("book_flight", "Book a flight").unwrap();

        let tools = set.as_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "book_flight");
        assert_eq!(tools[0]["function"]["description"], "Book a flight");
        assert!(tools[0]["function"]["parameters"]["properties"]["destination"].is_object());
    }

    #[test]
    fn same_name_replaces_previous_spec() {
        let set: FunctionSet = vec![
            FunctionSpec { name: "a".into(), description: None, parameters: empty_object_schema() },
            FunctionSpec { name: "a".into(), description: Some("v2".into()), parameters: empty_object_schema() },
        ]
        .into_iter()
        .collect();
        assert_eq!(set.definitions().len(), 1);
        assert_eq!(set.definitions()[0].description.as_deref(), Some("v2"));
    }

    #[test]
    fn failed_result_keeps_call_identity() {
        let call = FunctionCall {
            id: "call_1".into(),
            name: "lookup".into(),
            input: serde_json::json!({ "q": 1 }),
        };
        let result = call.failed("Error: couldn't contact server");
        assert_eq!(result.id, "call_1");
        assert_eq!(result.input, call.input);
        assert_eq!(result.result, "Error: couldn't contact server");
    }
}
