use crate::core::error::ProviderError;
use crate::llm::{ChatMessage, Completion, CompletionOptions, LlmClient, Usage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// One scripted reply.
#[derive(Clone, Debug)]
pub enum Scripted {
    Reply(String),
    Fail(ProviderError),
}

/// Recorded call, kept for assertions.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub options: CompletionOptions,
}

/// Deterministic LLM double.
///
/// Replies are taken from a per-route queue, where the route is the first line
/// of the system prompt (agents open their system prompts with a `# <name>`
/// heading). When a route queue is empty the default queue is used, and when
/// that is empty too the fallback responder decides.
pub struct ScriptedLlm {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    default: Mutex<VecDeque<Scripted>>,
    fallback: Option<Box<dyn Fn(&[ChatMessage]) -> Scripted + Send + Sync>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
    model: String,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            default: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
            model: "scripted".into(),
        }
    }

    /// Answers every agent with a schema-valid canned payload.
    pub fn canned() -> Self {
        Self::new().with_fallback(|messages| {
            match Self::route_of(messages).as_deref().and_then(canned_reply) {
                Some(value) => Scripted::Reply(value.to_string()),
                None => Scripted::Fail(ProviderError::EmptyResponse {
                    provider: "scripted".into(),
                }),
            }
        })
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let llm = Self::new();
        llm.default
            .lock()
            .extend(replies.into_iter().map(|r| Scripted::Reply(r.into())));
        llm
    }

    /// Responder consulted once the scripted queues are drained.
    pub fn with_fallback(
        mut self,
        f: impl Fn(&[ChatMessage]) -> Scripted + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(f));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: Scripted) {
        self.default.lock().push_back(reply);
    }

    pub fn push_route(&self, agent: &str, reply: Scripted) {
        self.routes
            .lock()
            .entry(agent.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn route_of(messages: &[ChatMessage]) -> Option<String> {
        let system = messages.first()?;
        let heading = system.content.lines().next()?;
        heading.strip_prefix("# ").map(|s| s.trim().to_string())
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> Scripted {
        if let Some(route) = Self::route_of(messages)
            && let Some(reply) = self
                .routes
                .lock()
                .get_mut(&route)
                .and_then(|q| q.pop_front())
        {
            return reply;
        }
        if let Some(reply) = self.default.lock().pop_front() {
            return reply;
        }
        match &self.fallback {
            Some(f) => f(messages),
            None => Scripted::Fail(ProviderError::EmptyResponse {
                provider: "scripted".into(),
            }),
        }
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

fn evidence(locator: &str) -> Value {
    json!([{
        "source_type": "filing",
        "reliability": "B",
        "claim_type": "fact",
        "locator": locator
    }])
}

/// Schema-valid payload for a known agent name.
pub fn canned_reply(agent: &str) -> Option<Value> {
    let value = match agent {
        "idea_enrichment" => json!({
            "edge_clarity": 0.7,
            "valuation_tension": 0.6,
            "catalyst_timing": 0.5,
            "business_quality": 0.6,
            "disclosure_friction": 0.2,
            "rationale": "Simulated triage"
        }),
        "business_model" => json!({
            "summary": "Sells industrial components to OEMs.",
            "revenue_streams": [{"name": "Components", "share_pct": 80}, {"name": "Services", "share_pct": 20}],
            "customer_segments": ["OEMs", "Aftermarket"],
            "unit_economics": null,
            "evidence": evidence("10-K Item 1")
        }),
        "industry_moat" => json!({
            "industry_structure": "Fragmented",
            "moat_sources": ["switching costs"],
            "moat_rating": "narrow",
            "competitors": ["Peer Co"],
            "evidence": evidence("10-K Item 1A")
        }),
        "financial_forensics" => json!({
            "revenue_quality": "Recurring share rising",
            "earnings_quality_score": 7,
            "red_flags": [],
            "accruals_comment": null,
            "evidence": evidence("10-K Item 8")
        }),
        "capital_allocation" => json!({
            "track_record": "Disciplined bolt-ons",
            "buybacks": "Opportunistic",
            "acquisitions": null,
            "dividend_policy": null,
            "rating": "good",
            "evidence": evidence("Proxy statement")
        }),
        "management_quality" => json!({
            "ceo_assessment": "Operator with long tenure",
            "alignment": "Pay tied to ROIC",
            "insider_ownership_pct": 4.5,
            "rating": "good",
            "evidence": evidence("DEF 14A")
        }),
        "valuation" => json!({
            "method": "DCF",
            "fair_value_low": 40.0,
            "fair_value_base": 55.0,
            "fair_value_high": 70.0,
            "current_price": 45.0,
            "upside_pct": 22.2,
            "key_assumptions": ["Mid-single-digit growth"],
            "evidence": evidence("Model")
        }),
        "risk_stress" => json!({
            "key_risks": [{"risk": "Cyclical demand", "probability": "medium", "impact": "high", "mitigant": null}],
            "stress_case": "Volumes fall 20%",
            "evidence": evidence("10-K Item 1A")
        }),
        "scenarios" => json!({
            "bull": {"narrative": "Margins expand", "probability": 0.25, "target_price": 75.0},
            "base": {"narrative": "Steady state", "probability": 0.5, "target_price": 55.0},
            "bear": {"narrative": "Recession", "probability": 0.25, "target_price": 35.0},
            "evidence": evidence("Model")
        }),
        _ => return None,
    };
    Some(value)
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        self.calls.lock().push(RecordedCall {
            messages: messages.to_vec(),
            options: options.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(messages) {
            Scripted::Reply(content) => {
                let completion_tokens = (content.len() / 4) as u32;
                let prompt_tokens = messages
                    .iter()
                    .map(|m| (m.content.len() / 4) as u32)
                    .sum();
                Ok(Completion {
                    content,
                    model: options.model.clone().unwrap_or_else(|| self.model.clone()),
                    usage: Usage {
                        prompt_tokens,
                        completion_tokens,
                        total_tokens: prompt_tokens + completion_tokens,
                    },
                    finish_reason: Some("stop".into()),
                })
            }
            Scripted::Fail(err) => Err(err),
        }
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}
