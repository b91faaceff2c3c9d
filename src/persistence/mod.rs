pub mod database;
pub mod memory;

use crate::core::types::{
    Evidence, IcBundle, IdeaCard, IdeaStatus, NoveltyRecord, PacketFailure, ResearchPacket,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence for every lane artifact. Packets, failures, evidence and
/// bundles are write-once; saving one whose id already exists is an error.
/// Time-range queries are half-open: `[start, end)`.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn upsert_idea(&self, idea: &IdeaCard) -> Result<()>;
    async fn get_idea(&self, id: Uuid) -> Result<Option<IdeaCard>>;
    /// Ordered by creation time, then ticker.
    async fn ideas_with_status(&self, statuses: &[IdeaStatus]) -> Result<Vec<IdeaCard>>;

    async fn save_packet(&self, packet: &ResearchPacket) -> Result<()>;
    async fn get_packet(&self, id: Uuid) -> Result<Option<ResearchPacket>>;
    /// Ordered by completion time.
    async fn packets_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ResearchPacket>>;

    async fn append_evidence(&self, evidence: &[Evidence]) -> Result<()>;
    async fn evidence_for_packet(&self, packet_id: Uuid) -> Result<Vec<Evidence>>;

    async fn save_failure(&self, failure: &PacketFailure) -> Result<()>;
    async fn failures_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PacketFailure>>;

    async fn save_bundle(&self, bundle: &IcBundle) -> Result<()>;
    async fn get_bundle(&self, id: Uuid) -> Result<Option<IcBundle>>;
    async fn latest_bundle(&self) -> Result<Option<IcBundle>>;

    async fn upsert_novelty(&self, record: &NoveltyRecord) -> Result<()>;
    async fn novelty_records(&self) -> Result<Vec<NoveltyRecord>>;
}
