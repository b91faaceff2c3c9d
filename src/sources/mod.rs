pub mod normalizers;
pub mod screener;
pub mod simulator;

use crate::core::error::ProviderError;
use crate::core::types::{ConfidenceTier, Direction, IdeaSignals, SourceDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Candidate as a source reports it, before normalization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawIdea {
    pub ticker: String,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub thesis: String,
    pub confidence: ConfidenceTier,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub signals: IdeaSignals,
    /// When the source first surfaced the idea. Defaults to fetch time.
    #[serde(default)]
    pub first_seen_at: Option<DateTime<Utc>>,
}

fn default_direction() -> Direction {
    Direction::Long
}

#[async_trait]
pub trait IdeaSource: Send + Sync + 'static {
    fn descriptor(&self) -> &SourceDescriptor;

    async fn fetch(&self) -> Result<Vec<RawIdea>, ProviderError>;
}
