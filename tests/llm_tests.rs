use async_trait::async_trait;
use llm_call_rs::llm::directive;
use llm_call_rs::{
    AgentOptions, Completion, Directive, Llm, LlmParams, ModelBackend, ModelContext, RawCompletion, Result,
};
use serde_json::json;

struct Fixed(&'static str);

#[async_trait]
impl ModelBackend for Fixed {
    async fn initial(&mut self, _ctx: &ModelContext<'_>) -> Result<RawCompletion> {
        Ok(RawCompletion::text(self.0))
    }

    async fn completion(&mut self, _ctx: &ModelContext<'_>, _input: &str) -> Result<RawCompletion> {
        Ok(RawCompletion::text(self.0))
    }
}

fn llm(prompt: &str, reply: &'static str) -> Llm {
    let params = LlmParams {
        user: "CA1".to_string(),
        prompt: prompt.to_string(),
        functions: None,
        options: AgentOptions::default(),
    };
    Llm::new(params, Box::new(Fixed(reply))).unwrap()
}

#[test]
fn directive_example_parses() {
    let parsed = directive::parse("Hello@DATA:{\"x\":1}\nBye@HANGUP");
    assert_eq!(parsed.text, r#"Hello<break strength="medium" />Bye"#);
    assert_eq!(parsed.directives, vec![Directive::Data(json!({ "x": 1 })), Directive::Hangup]);
}

#[test]
fn trailing_text_after_last_directive_is_dropped() {
    let parsed = directive::parse("Booked@DATA: {\"ref\":\"A1\"}\nanything else");
    assert_eq!(parsed.text, "Booked");
    assert_eq!(parsed.data(), Some(&json!({ "ref": "A1" })));
}

#[test]
fn empty_raw_completion_has_no_text() {
    let completion = Completion::from_raw(RawCompletion::default());
    assert!(completion.text.is_none());
    assert!(!completion.hangup);
}

#[tokio::test]
async fn initial_turn_is_parsed() {
    let mut llm = llm("Greet the caller", "Welcome!\n\nHow can I help?@DATA: {\"stage\":\"greeting\"}");
    let completion = llm.initial().await.unwrap();
    assert_eq!(completion.text.as_deref(), Some(r#"Welcome!<break strength="strong" />How can I help?"#));
    assert_eq!(completion.data, Some(json!({ "stage": "greeting" })));
}

#[tokio::test]
async fn hints_come_from_initial_prompt_only() {
    let mut llm = llm("Book a flight to Rome", "ok");
    assert_eq!(llm.voice_hints(), ["Book", "flight", "Rome"]);
    llm.set_prompt("Sell train tickets to Paris");
    llm.completion("hello").await.unwrap();
    assert_eq!(llm.voice_hints(), ["Book", "flight", "Rome"]);
    assert_eq!(llm.prompt(), "Sell train tickets to Paris");
}
