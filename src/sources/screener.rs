use crate::config::config::SourceCfg;
use crate::core::error::ProviderError;
use crate::core::types::SourceDescriptor;
use crate::sources::{IdeaSource, RawIdea};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// HTTP JSON feed. Accepts either a bare array or `{"ideas": [...]}`.
pub struct ScreenerSource {
    client: Client,
    cfg: SourceCfg,
    descriptor: SourceDescriptor,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedBody {
    Bare(Vec<RawIdea>),
    Wrapped { ideas: Vec<RawIdea> },
}

impl ScreenerSource {
    pub fn new(client: Client, cfg: SourceCfg) -> Self {
        let descriptor = SourceDescriptor {
            name: cfg.name.clone(),
            kind: cfg.kind,
        };
        Self {
            client,
            cfg,
            descriptor,
        }
    }
}

#[async_trait]
impl IdeaSource for ScreenerSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self) -> Result<Vec<RawIdea>, ProviderError> {
        let name = &self.cfg.name;
        debug!(source = %name, url = %self.cfg.url, "Fetching ideas");

        let mut req = self.client.get(&self.cfg.url);
        if !self.cfg.api_key.is_empty() {
            req = req.bearer_auth(&self.cfg.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::request(name.as_str(), e))?;
        if !resp.status().is_success() {
            return Err(ProviderError::request(
                name.as_str(),
                format!("status {}", resp.status()),
            ));
        }

        let body: FeedBody = resp
            .json()
            .await
            .map_err(|e| ProviderError::request(name.as_str(), e))?;
        Ok(match body {
            FeedBody::Bare(ideas) | FeedBody::Wrapped { ideas } => ideas,
        })
    }
}
