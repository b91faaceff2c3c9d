use crate::config::config::LlmCfg;
use crate::core::error::ProviderError;
use crate::llm::{ChatMessage, Completion, CompletionOptions, LlmClient, Role, Usage};
use anyhow::Result;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

const PROVIDER: &str = "openai";

/// OpenAI-compatible chat client, rate limited across all agents sharing it.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    cfg: LlmCfg,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl OpenAiClient {
    pub fn new(cfg: LlmCfg) -> Self {
        let rpm = NonZeroU32::new(cfg.rate_limit_rpm).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        let openai_config = OpenAIConfig::new()
            .with_api_key(&cfg.api_key)
            .with_api_base(&cfg.base_url);

        Self {
            client: Client::with_config(openai_config),
            cfg,
            limiter,
        }
    }

    fn to_request_message(msg: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
        let built = match msg.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(msg.content.clone())
                .build()?
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(msg.content.clone())
                .build()?
                .into(),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(msg.content.clone())
                .build()?
                .into(),
        };
        Ok(built)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        self.limiter.until_ready().await;

        let model = options.model.as_deref().unwrap_or(&self.cfg.model);
        let request_messages = messages
            .iter()
            .map(Self::to_request_message)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| ProviderError::request(PROVIDER, e))?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model)
            .messages(request_messages)
            .max_completion_tokens(options.max_tokens.unwrap_or(self.cfg.max_tokens))
            .temperature(options.temperature.unwrap_or(self.cfg.temperature));
        if options.json_mode {
            args.response_format(ResponseFormat::JsonObject);
        }
        let request = args
            .build()
            .map_err(|e| ProviderError::request(PROVIDER, e))?;

        debug!(base_url = %self.cfg.base_url, model, "Calling LLM");

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ProviderError::request(PROVIDER, e))?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| ProviderError::EmptyResponse {
                provider: PROVIDER.into(),
            })?;
        let content = choice
            .message
            .content
            .clone()
            .ok_or_else(|| ProviderError::EmptyResponse {
                provider: PROVIDER.into(),
            })?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(Completion {
            content,
            model: response.model.clone(),
            usage,
            finish_reason: choice
                .finish_reason
                .as_ref()
                .map(|r| format!("{r:?}").to_lowercase()),
        })
    }

    fn default_model(&self) -> &str {
        &self.cfg.model
    }
}
