use crate::core::types::{
    Evidence, IcBundle, IdeaCard, IdeaStatus, NoveltyRecord, PacketFailure, ResearchPacket,
};
use crate::persistence::Store;
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    ideas: HashMap<Uuid, IdeaCard>,
    packets: Vec<ResearchPacket>,
    evidence: Vec<Evidence>,
    failures: Vec<PacketFailure>,
    bundles: Vec<IcBundle>,
    novelty: HashMap<String, NoveltyRecord>,
}

/// Process-local store used by tests, simulations and single-shot runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_idea(&self, idea: &IdeaCard) -> Result<()> {
        self.tables.write().ideas.insert(idea.id, idea.clone());
        Ok(())
    }

    async fn get_idea(&self, id: Uuid) -> Result<Option<IdeaCard>> {
        Ok(self.tables.read().ideas.get(&id).cloned())
    }

    async fn ideas_with_status(&self, statuses: &[IdeaStatus]) -> Result<Vec<IdeaCard>> {
        let mut out: Vec<IdeaCard> = self
            .tables
            .read()
            .ideas
            .values()
            .filter(|i| statuses.contains(&i.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });
        Ok(out)
    }

    async fn save_packet(&self, packet: &ResearchPacket) -> Result<()> {
        let mut t = self.tables.write();
        if t.packets.iter().any(|p| p.id == packet.id) {
            bail!("packet {} already exists", packet.id);
        }
        t.packets.push(packet.clone());
        Ok(())
    }

    async fn get_packet(&self, id: Uuid) -> Result<Option<ResearchPacket>> {
        Ok(self.tables.read().packets.iter().find(|p| p.id == id).cloned())
    }

    async fn packets_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ResearchPacket>> {
        let mut out: Vec<_> = self
            .tables
            .read()
            .packets
            .iter()
            .filter(|p| p.completed_at >= start && p.completed_at < end)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.completed_at);
        Ok(out)
    }

    async fn append_evidence(&self, evidence: &[Evidence]) -> Result<()> {
        let mut t = self.tables.write();
        for e in evidence {
            if t.evidence.iter().any(|x| x.id == e.id) {
                bail!("evidence {} already exists", e.id);
            }
        }
        t.evidence.extend_from_slice(evidence);
        Ok(())
    }

    async fn evidence_for_packet(&self, packet_id: Uuid) -> Result<Vec<Evidence>> {
        Ok(self
            .tables
            .read()
            .evidence
            .iter()
            .filter(|e| e.packet_id == packet_id)
            .cloned()
            .collect())
    }

    async fn save_failure(&self, failure: &PacketFailure) -> Result<()> {
        let mut t = self.tables.write();
        if t.failures.iter().any(|f| f.id == failure.id) {
            bail!("failure {} already exists", failure.id);
        }
        t.failures.push(failure.clone());
        Ok(())
    }

    async fn failures_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PacketFailure>> {
        let mut out: Vec<_> = self
            .tables
            .read()
            .failures
            .iter()
            .filter(|f| f.failed_at >= start && f.failed_at < end)
            .cloned()
            .collect();
        out.sort_by_key(|f| f.failed_at);
        Ok(out)
    }

    async fn save_bundle(&self, bundle: &IcBundle) -> Result<()> {
        let mut t = self.tables.write();
        if t.bundles.iter().any(|b| b.id == bundle.id) {
            bail!("bundle {} already exists", bundle.id);
        }
        t.bundles.push(bundle.clone());
        Ok(())
    }

    async fn get_bundle(&self, id: Uuid) -> Result<Option<IcBundle>> {
        Ok(self.tables.read().bundles.iter().find(|b| b.id == id).cloned())
    }

    async fn latest_bundle(&self) -> Result<Option<IcBundle>> {
        Ok(self
            .tables
            .read()
            .bundles
            .iter()
            .max_by_key(|b| (b.window_end, b.created_at))
            .cloned())
    }

    async fn upsert_novelty(&self, record: &NoveltyRecord) -> Result<()> {
        self.tables
            .write()
            .novelty
            .insert(record.ticker.clone(), record.clone());
        Ok(())
    }

    async fn novelty_records(&self) -> Result<Vec<NoveltyRecord>> {
        let mut out: Vec<_> = self.tables.read().novelty.values().cloned().collect();
        out.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(out)
    }
}
