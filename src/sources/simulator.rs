use crate::core::error::ProviderError;
use crate::core::types::{ConfidenceTier, Direction, IdeaSignals, SourceDescriptor, SourceKind};
use crate::sources::{IdeaSource, RawIdea};
use async_trait::async_trait;
use std::time::Duration;

/// Source that hands back a fixed list, optionally after a delay or as a failure.
pub struct StaticSource {
    descriptor: SourceDescriptor,
    ideas: Vec<RawIdea>,
    fail: bool,
    delay: Option<Duration>,
}

impl StaticSource {
    pub fn new(name: &str, ideas: Vec<RawIdea>) -> Self {
        Self {
            descriptor: SourceDescriptor {
                name: name.to_string(),
                kind: SourceKind::Simulated,
            },
            ideas,
            fail: false,
            delay: None,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `count` ideas named `{prefix}{i}` with the given confidence.
    pub fn generated(name: &str, prefix: &str, count: usize, confidence: ConfidenceTier) -> Self {
        let ideas = (0..count)
            .map(|i| RawIdea {
                ticker: ticker_for(prefix, i),
                direction: Direction::Long,
                thesis: format!("Generated idea {i} from {name}"),
                confidence,
                style: Some("value".into()),
                signals: IdeaSignals::default(),
                first_seen_at: None,
            })
            .collect();
        Self::new(name, ideas)
    }
}

/// Letters-only ticker so generated symbols pass normalization.
pub fn ticker_for(prefix: &str, i: usize) -> String {
    let a = (b'A' + (i / 26 % 26) as u8) as char;
    let b = (b'A' + (i % 26) as u8) as char;
    format!("{prefix}{a}{b}")
}

#[async_trait]
impl IdeaSource for StaticSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self) -> Result<Vec<RawIdea>, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ProviderError::request(
                self.descriptor.name.as_str(),
                "simulated outage",
            ));
        }
        Ok(self.ideas.clone())
    }
}
