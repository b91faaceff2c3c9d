//! Validate-with-retry loop around a single LLM call.
//!
//! One run walks `Prompting -> AwaitingResponse -> Validating` and then ends in
//! `Success`, `Failed`, or goes through `Retrying` back to `AwaitingResponse` with
//! a corrective prompt. Provider errors end the run immediately; the runtime
//! never retries a transport failure.

use crate::agents::catalog::{AgentSpec, PromptContext};
use crate::config::config::LlmCfg;
use crate::core::error::ProviderError;
use crate::llm::{ChatMessage, CompletionOptions, LlmClient, Usage};
use crate::schema::validator::{FieldError, Validation, validate};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Prompting,
    AwaitingResponse,
    Validating,
    Retrying,
    Success,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct AttemptRecord {
    pub number: u32,
    /// User-visible prompt for this attempt: the task prompt first, the
    /// corrective prompt afterwards.
    pub prompt: String,
    pub output: Option<String>,
    pub errors: Vec<FieldError>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentAudit {
    pub agent: String,
    pub model: String,
    pub attempts: Vec<AttemptRecord>,
    pub transitions: Vec<AgentState>,
    pub usage: Usage,
    pub elapsed: Duration,
}

impl AgentAudit {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

#[derive(Debug)]
pub enum AgentOutcome {
    Success { value: Value, audit: AgentAudit },
    Failed { errors: Vec<FieldError>, audit: AgentAudit },
    ProviderFailed { error: ProviderError, audit: AgentAudit },
}

impl AgentOutcome {
    pub fn audit(&self) -> &AgentAudit {
        match self {
            AgentOutcome::Success { audit, .. }
            | AgentOutcome::Failed { audit, .. }
            | AgentOutcome::ProviderFailed { audit, .. } => audit,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AgentOutcome::Success { .. } => "success",
            AgentOutcome::Failed { .. } => "failed",
            AgentOutcome::ProviderFailed { .. } => "provider_failed",
        }
    }
}

#[derive(Clone)]
pub struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    cfg: LlmCfg,
}

impl AgentRuntime {
    pub fn new(llm: Arc<dyn LlmClient>, cfg: LlmCfg) -> Self {
        Self { llm, cfg }
    }

    /// Routing for `agent`: configured override, else client defaults.
    fn options_for(&self, agent: &str) -> CompletionOptions {
        match self.cfg.routes.get(agent) {
            Some(route) => CompletionOptions {
                model: Some(route.model.clone()),
                max_tokens: route.max_tokens.or(Some(self.cfg.max_tokens)),
                temperature: route.temperature.or(Some(self.cfg.temperature)),
                json_mode: true,
            },
            None => CompletionOptions {
                model: None,
                max_tokens: Some(self.cfg.max_tokens),
                temperature: Some(self.cfg.temperature),
                json_mode: true,
            },
        }
    }

    pub async fn run(&self, spec: &AgentSpec, ctx: &PromptContext<'_>) -> AgentOutcome {
        let started = Instant::now();
        let options = self.options_for(spec.name);
        let max_attempts = self.cfg.max_attempts.max(1);

        let mut audit = AgentAudit {
            agent: spec.name.to_string(),
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.llm.default_model().to_string()),
            attempts: Vec::new(),
            transitions: vec![AgentState::Prompting],
            usage: Usage::default(),
            elapsed: Duration::ZERO,
        };

        let user_prompt = (spec.build_prompt)(ctx);
        let mut messages = vec![
            ChatMessage::system(spec.system_prompt),
            ChatMessage::user(user_prompt.clone()),
        ];
        let mut prompt = user_prompt.clone();

        let outcome = loop {
            let number = audit.attempts.len() as u32 + 1;
            audit.transitions.push(AgentState::AwaitingResponse);

            let completion = match tokio::time::timeout(
                self.cfg.call_timeout,
                self.llm.complete(&messages, &options),
            )
            .await
            {
                Ok(Ok(c)) => c,
                Ok(Err(error)) => break self.provider_failed(error, prompt, number, &mut audit),
                Err(_) => {
                    let error = ProviderError::Timeout {
                        provider: "llm".into(),
                        after: self.cfg.call_timeout,
                    };
                    break self.provider_failed(error, prompt, number, &mut audit);
                }
            };

            audit.model = completion.model.clone();
            audit.usage.prompt_tokens += completion.usage.prompt_tokens;
            audit.usage.completion_tokens += completion.usage.completion_tokens;
            audit.usage.total_tokens += completion.usage.total_tokens;
            audit.transitions.push(AgentState::Validating);

            let errors = match parse_payload(&completion.content) {
                Ok(payload) => match validate(spec.schema, &payload) {
                    Validation::Valid(value) => {
                        audit.attempts.push(AttemptRecord {
                            number,
                            prompt,
                            output: Some(completion.content),
                            errors: Vec::new(),
                        });
                        audit.transitions.push(AgentState::Success);
                        break Outcome::Success(value);
                    }
                    Validation::Invalid(errors) => errors,
                },
                Err(error) => vec![error],
            };

            debug!(
                agent = spec.name,
                attempt = number,
                errors = errors.len(),
                "Output failed validation"
            );
            audit.attempts.push(AttemptRecord {
                number,
                prompt,
                output: Some(completion.content.clone()),
                errors: errors.clone(),
            });

            if number >= max_attempts {
                audit.transitions.push(AgentState::Failed);
                break Outcome::Failed(errors);
            }

            audit.transitions.push(AgentState::Retrying);
            prompt = corrective_prompt(spec.schema.as_str(), &errors);
            messages = vec![
                ChatMessage::system(spec.system_prompt),
                ChatMessage::user(user_prompt.clone()),
                ChatMessage::assistant(completion.content),
                ChatMessage::user(prompt.clone()),
            ];
        };

        audit.elapsed = started.elapsed();
        let outcome = match outcome {
            Outcome::Success(value) => AgentOutcome::Success { value, audit },
            Outcome::Failed(errors) => AgentOutcome::Failed { errors, audit },
            Outcome::Provider(error) => AgentOutcome::ProviderFailed { error, audit },
        };

        metrics::counter!("agent_attempts_total", "agent" => spec.name, "outcome" => outcome.label())
            .increment(outcome.audit().attempts.len() as u64);
        outcome
    }

    fn provider_failed(
        &self,
        error: ProviderError,
        prompt: String,
        number: u32,
        audit: &mut AgentAudit,
    ) -> Outcome {
        warn!(agent = %audit.agent, attempt = number, %error, "LLM call failed");
        audit.attempts.push(AttemptRecord {
            number,
            prompt,
            output: None,
            errors: Vec::new(),
        });
        audit.transitions.push(AgentState::Failed);
        Outcome::Provider(error)
    }
}

enum Outcome {
    Success(Value),
    Failed(Vec<FieldError>),
    Provider(ProviderError),
}

/// Strips markdown fences and parses JSON. Unparseable output becomes a single
/// error at the document root.
pub fn parse_payload(content: &str) -> Result<Value, FieldError> {
    let clean = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(clean).map_err(|e| FieldError {
        path: "$".into(),
        expected: "JSON document".into(),
        actual: format!("unparseable output ({e})"),
    })
}

/// Same errors in, same prompt out.
pub fn corrective_prompt(schema: &str, errors: &[FieldError]) -> String {
    let mut sorted = errors.to_vec();
    sorted.sort_by(|a, b| {
        a.path
            .cmp(&b.path)
            .then_with(|| a.expected.cmp(&b.expected))
            .then_with(|| a.actual.cmp(&b.actual))
    });

    let mut out = format!(
        "Your previous response does not satisfy the `{schema}` schema.\n\
Fix every error below and reply with the complete corrected JSON object only.\n\nErrors:\n"
    );
    for (i, e) in sorted.iter().enumerate() {
        out.push_str(&format!("{}. {e}\n", i + 1));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::catalog::{IDEA_ENRICHMENT, VALUATION};
    use crate::config::config::ModelRoute;
    use crate::core::types::{
        ConfidenceTier, Direction, IdeaCard, IdeaSignals, IdeaStatus, SourceDescriptor,
        SourceKind,
    };
    use crate::llm::Role;
    use crate::llm::simulator::{Scripted, ScriptedLlm};
    use chrono::Utc;
    use uuid::Uuid;

    fn idea() -> IdeaCard {
        let now = Utc::now();
        IdeaCard {
            id: Uuid::new_v4(),
            ticker: "ACME".into(),
            direction: Direction::Long,
            thesis: "Margin recovery after restructuring".into(),
            confidence: ConfidenceTier::High,
            source: SourceDescriptor {
                name: "screener".into(),
                kind: SourceKind::Screener,
            },
            corroborating_sources: vec![],
            style: "value".into(),
            status: IdeaStatus::Selected,
            status_reason: None,
            signals: IdeaSignals::default(),
            score: None,
            first_seen_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    const VALID: &str = r#"{"edge_clarity":0.8,"valuation_tension":0.6,"catalyst_timing":0.4,"business_quality":0.7,"disclosure_friction":0.1,"rationale":"Spin-off"}"#;
    const INVALID: &str = r#"{"edge_clarity":"high","valuation_tension":0.6,"catalyst_timing":0.4,"business_quality":0.7,"disclosure_friction":0.1}"#;

    fn runtime(llm: Arc<ScriptedLlm>) -> AgentRuntime {
        AgentRuntime::new(llm, LlmCfg::default())
    }

    #[tokio::test]
    async fn fail_then_succeed_takes_exactly_two_attempts() {
        let llm = Arc::new(ScriptedLlm::with_replies([INVALID, VALID]));
        let idea = idea();
        let ctx = PromptContext {
            idea: &idea,
            company: None,
        };

        let outcome = runtime(llm.clone()).run(&IDEA_ENRICHMENT, &ctx).await;

        let AgentOutcome::Success { value, audit } = outcome else {
            panic!("expected success");
        };
        assert_eq!(value["rationale"], "Spin-off");
        assert_eq!(audit.attempt_count(), 2);
        assert_eq!(llm.call_count(), 2);

        let first_errors = &audit.attempts[0].errors;
        assert_eq!(first_errors.len(), 2);
        for err in first_errors {
            assert!(audit.attempts[1].prompt.contains(&err.to_string()));
        }

        let retry = &llm.calls()[1].messages;
        assert_eq!(retry.len(), 4);
        assert_eq!(retry[2].role, Role::Assistant);
        assert_eq!(retry[2].content, INVALID);
        assert_eq!(
            audit.transitions,
            vec![
                AgentState::Prompting,
                AgentState::AwaitingResponse,
                AgentState::Validating,
                AgentState::Retrying,
                AgentState::AwaitingResponse,
                AgentState::Validating,
                AgentState::Success,
            ]
        );
    }

    #[tokio::test]
    async fn always_failing_returns_last_errors() {
        let llm = Arc::new(ScriptedLlm::with_replies([INVALID, "not json at all"]));
        let idea = idea();
        let ctx = PromptContext {
            idea: &idea,
            company: None,
        };

        let outcome = runtime(llm.clone()).run(&IDEA_ENRICHMENT, &ctx).await;

        let AgentOutcome::Failed { errors, audit } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(audit.attempt_count(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "$");
        assert_eq!(errors[0].expected, "JSON document");
        assert_eq!(audit.transitions.last(), Some(&AgentState::Failed));
    }

    #[tokio::test]
    async fn provider_errors_are_not_retried() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(Scripted::Fail(ProviderError::request("llm", "401 unauthorized")));
        llm.push(Scripted::Reply(VALID.into()));
        let idea = idea();
        let ctx = PromptContext {
            idea: &idea,
            company: None,
        };

        let outcome = runtime(llm.clone()).run(&IDEA_ENRICHMENT, &ctx).await;

        assert!(matches!(outcome, AgentOutcome::ProviderFailed { .. }));
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let llm = Arc::new(ScriptedLlm::with_replies([VALID]).with_delay(Duration::from_secs(5)));
        let cfg = LlmCfg {
            call_timeout: Duration::from_millis(20),
            ..LlmCfg::default()
        };
        let idea = idea();
        let ctx = PromptContext {
            idea: &idea,
            company: None,
        };

        let outcome = AgentRuntime::new(llm, cfg).run(&IDEA_ENRICHMENT, &ctx).await;

        let AgentOutcome::ProviderFailed { error, .. } = outcome else {
            panic!("expected timeout");
        };
        assert!(matches!(error, ProviderError::Timeout { .. }));
    }

    #[tokio::test]
    async fn routes_override_model_per_agent() {
        let llm = Arc::new(ScriptedLlm::with_replies(["{}"]));
        let mut cfg = LlmCfg::default();
        cfg.max_attempts = 1;
        cfg.routes.insert(
            "valuation".into(),
            ModelRoute {
                model: "deep-model".into(),
                temperature: Some(0.0),
                max_tokens: None,
            },
        );
        let idea = idea();
        let ctx = PromptContext {
            idea: &idea,
            company: None,
        };

        let outcome = AgentRuntime::new(llm.clone(), cfg).run(&VALUATION, &ctx).await;

        assert!(matches!(outcome, AgentOutcome::Failed { .. }));
        let options = &llm.calls()[0].options;
        assert_eq!(options.model.as_deref(), Some("deep-model"));
        assert_eq!(options.temperature, Some(0.0));
        assert_eq!(outcome.audit().model, "deep-model");
    }

    #[test]
    fn corrective_prompt_is_sorted_and_numbered() {
        let errors = vec![
            FieldError {
                path: "$.z".into(),
                expected: "string".into(),
                actual: "number".into(),
            },
            FieldError {
                path: "$.a".into(),
                expected: "number".into(),
                actual: "missing".into(),
            },
        ];
        let prompt = corrective_prompt("valuation", &errors);
        let a = prompt.find("1. `$.a`").unwrap();
        let z = prompt.find("2. `$.z`").unwrap();
        assert!(a < z);
        assert_eq!(prompt, corrective_prompt("valuation", &errors));
    }

    #[test]
    fn fenced_json_is_accepted() {
        let v = parse_payload("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
    }
}
