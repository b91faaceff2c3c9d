use crate::core::types::{
    BundleEntry, BundleExclusion, IcBundle, IdeaStatus, PacketStatus,
};
use crate::lanes::report::{BundleSummary, ItemOutcome, Lane, LaneSummary, ReportBuilder, RunReport};
use crate::persistence::Store;
use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

/// ISO week of `at` in `tz`, e.g. `2026-W42`.
pub fn week_label(at: DateTime<Utc>, tz: Tz) -> String {
    let week = at.with_timezone(&tz).iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Assembles the weekly investment-committee bundle.
pub struct BundleAssembler {
    store: Arc<dyn Store>,
    tz: Tz,
}

impl BundleAssembler {
    pub fn new(store: Arc<dyn Store>, tz: Tz) -> Self {
        Self { store, tz }
    }

    async fn assemble(&self, as_of: DateTime<Utc>) -> anyhow::Result<IcBundle> {
        let start = match self.store.latest_bundle().await? {
            Some(prev) => prev.window_end,
            None => as_of - Duration::days(7),
        };
        let start = start.min(as_of);

        let packets = self.store.packets_completed_between(start, as_of).await?;
        let failures = self.store.failures_between(start, as_of).await?;
        // a promoted idea whose packet landed is done even if its status write was lost
        let packaged: HashSet<Uuid> = packets.iter().map(|p| p.idea_id).collect();
        let in_progress = self
            .store
            .ideas_with_status(&[IdeaStatus::Promoted])
            .await?
            .into_iter()
            .filter(|idea| !packaged.contains(&idea.id));

        let excluded = failures
            .into_iter()
            .map(|f| BundleExclusion {
                idea_id: f.idea_id,
                ticker: f.ticker,
                reason: format!("research failed: {}", f.reason),
            })
            .chain(in_progress.map(|idea| BundleExclusion {
                idea_id: idea.id,
                ticker: idea.ticker,
                reason: "research still in progress".into(),
            }))
            .collect();

        Ok(IcBundle {
            id: Uuid::new_v4(),
            week_label: week_label(as_of, self.tz),
            window_start: start,
            window_end: as_of,
            packets: packets
                .into_iter()
                .map(|p| BundleEntry {
                    packet_id: p.id,
                    idea_id: p.idea_id,
                    ticker: p.ticker,
                    status: p.status,
                })
                .collect(),
            excluded,
            created_at: as_of,
        })
    }

    #[instrument(name = "ic_bundle", skip(self, cancel))]
    pub async fn run(
        &self,
        as_of: DateTime<Utc>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> RunReport {
        let mut report = ReportBuilder::new(Lane::Bundle, as_of, dry_run);
        let mut summary = BundleSummary::default();

        if cancel.is_cancelled() {
            report.abort("cancelled");
            return report.finish(LaneSummary::Bundle(summary));
        }

        let bundle = match self.assemble(as_of).await {
            Ok(b) => b,
            Err(e) => {
                report.abort(format!("store: {e:#}"));
                return report.finish(LaneSummary::Bundle(summary));
            }
        };

        summary.week_label = bundle.week_label.clone();
        summary.window_start = Some(bundle.window_start);
        summary.window_end = Some(bundle.window_end);
        summary.included = bundle.packets.len();
        summary.degraded = bundle
            .packets
            .iter()
            .filter(|e| e.status == PacketStatus::Degraded)
            .count();
        summary.excluded = bundle.excluded.len();

        let included = if dry_run {
            ItemOutcome::Planned
        } else {
            ItemOutcome::Processed
        };
        for entry in &bundle.packets {
            report.item(
                Some(entry.idea_id),
                &entry.ticker,
                included,
                format!("packet {} ({:?})", entry.packet_id, entry.status),
            );
        }
        for ex in &bundle.excluded {
            report.item(Some(ex.idea_id), &ex.ticker, ItemOutcome::Skipped, &ex.reason);
        }

        if !dry_run {
            if let Err(e) = self.store.save_bundle(&bundle).await {
                report.abort(format!("store: {e:#}"));
                return report.finish(LaneSummary::Bundle(summary));
            }
            summary.bundle_id = Some(bundle.id);
        }

        info!(
            week = %summary.week_label,
            included = summary.included,
            degraded = summary.degraded,
            excluded = summary.excluded,
            "IC bundle assembled"
        );
        report.finish(LaneSummary::Bundle(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        ConfidenceTier, Direction, IdeaCard, IdeaSignals, ModuleKind, PacketFailure,
        ResearchPacket, SourceDescriptor, SourceKind,
    };
    use crate::lanes::report::RunStatus;
    use crate::persistence::memory::MemoryStore;
    use chrono::TimeZone;

    const NY: Tz = chrono_tz::America::New_York;

    fn friday_evening() -> DateTime<Utc> {
        // 18:00 in New York
        Utc.with_ymd_and_hms(2026, 10, 16, 22, 0, 0).unwrap()
    }

    fn packet(ticker: &str, status: PacketStatus, at: DateTime<Utc>) -> ResearchPacket {
        ResearchPacket {
            id: Uuid::new_v4(),
            idea_id: Uuid::new_v4(),
            ticker: ticker.into(),
            status,
            modules: vec![],
            completed_at: at,
        }
    }

    fn promoted(ticker: &str, at: DateTime<Utc>) -> IdeaCard {
        IdeaCard {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            direction: Direction::Long,
            thesis: "t".into(),
            confidence: ConfidenceTier::High,
            source: SourceDescriptor {
                name: "alpha".into(),
                kind: SourceKind::Simulated,
            },
            corroborating_sources: vec![],
            style: "value".into(),
            status: IdeaStatus::Promoted,
            status_reason: None,
            signals: IdeaSignals::default(),
            score: None,
            first_seen_at: at,
            created_at: at,
            updated_at: at,
        }
    }

    fn summary(report: &RunReport) -> &BundleSummary {
        match &report.summary {
            LaneSummary::Bundle(s) => s,
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[test]
    fn week_label_uses_iso_weeks_in_local_time() {
        assert_eq!(week_label(friday_evening(), NY), "2026-W42");
        // Monday 02:00 UTC is still Sunday in New York
        let sunday_night = Utc.with_ymd_and_hms(2026, 10, 19, 2, 0, 0).unwrap();
        assert_eq!(week_label(sunday_night, NY), "2026-W42");
        let new_year = Utc.with_ymd_and_hms(2027, 1, 1, 17, 0, 0).unwrap();
        assert_eq!(week_label(new_year, NY), "2026-W53");
    }

    #[tokio::test]
    async fn collects_week_and_reports_exclusions() {
        let as_of = friday_evening();
        let store = Arc::new(MemoryStore::new());
        store.save_packet(&packet("AAA", PacketStatus::Complete, as_of - Duration::days(3))).await.unwrap();
        store.save_packet(&packet("BBB", PacketStatus::Degraded, as_of - Duration::days(1))).await.unwrap();
        store.save_packet(&packet("OLD", PacketStatus::Complete, as_of - Duration::days(9))).await.unwrap();
        store
            .save_failure(&PacketFailure {
                id: Uuid::new_v4(),
                idea_id: Uuid::new_v4(),
                ticker: "CCC".into(),
                module: Some(ModuleKind::Valuation),
                reason: "valuation: output invalid after 2 attempt(s)".into(),
                failed_at: as_of - Duration::days(2),
            })
            .await
            .unwrap();
        store.upsert_idea(&promoted("DDD", as_of)).await.unwrap();

        let assembler = BundleAssembler::new(store.clone(), NY);
        let report = assembler.run(as_of, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!((s.included, s.degraded, s.excluded), (2, 1, 2));
        let bundle = store.get_bundle(s.bundle_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(bundle.week_label, "2026-W42");
        assert!(bundle.packets.iter().all(|p| p.ticker != "OLD"));
        assert!(bundle.excluded.iter().any(|e| e.ticker == "CCC"));
        assert!(bundle.excluded.iter().any(|e| e.reason == "research still in progress"));
    }

    #[tokio::test]
    async fn second_bundle_without_new_packets_is_empty() {
        let as_of = friday_evening();
        let store = Arc::new(MemoryStore::new());
        store.save_packet(&packet("AAA", PacketStatus::Complete, as_of - Duration::days(1))).await.unwrap();
        let assembler = BundleAssembler::new(store.clone(), NY);

        let first = assembler.run(as_of, false, &CancellationToken::new()).await;
        let second = assembler
            .run(as_of + Duration::minutes(5), false, &CancellationToken::new())
            .await;

        assert_eq!(summary(&first).included, 1);
        assert_eq!(second.status, RunStatus::Completed);
        let s = summary(&second);
        assert_eq!(s.included, 0);
        assert_eq!(s.window_start, Some(as_of));
        assert_ne!(s.bundle_id, summary(&first).bundle_id);
        let original = store.get_bundle(summary(&first).bundle_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(original.packets.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_saves_nothing() {
        let as_of = friday_evening();
        let store = Arc::new(MemoryStore::new());
        store.save_packet(&packet("AAA", PacketStatus::Complete, as_of - Duration::days(1))).await.unwrap();
        let assembler = BundleAssembler::new(store.clone(), NY);

        let report = assembler.run(as_of, true, &CancellationToken::new()).await;

        assert_eq!(report.items_with(ItemOutcome::Planned).count(), 1);
        assert!(summary(&report).bundle_id.is_none());
        assert!(store.latest_bundle().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn promoted_idea_with_a_packet_is_not_in_progress() {
        let as_of = friday_evening();
        let store = Arc::new(MemoryStore::new());
        let idea = promoted("EEE", as_of - Duration::days(1));
        store.upsert_idea(&idea).await.unwrap();
        let mut done = packet("EEE", PacketStatus::Complete, as_of - Duration::days(1));
        done.idea_id = idea.id;
        store.save_packet(&done).await.unwrap();

        let report = BundleAssembler::new(store.clone(), NY)
            .run(as_of, false, &CancellationToken::new())
            .await;
        let s = summary(&report);

        assert_eq!((s.included, s.excluded), (1, 0));
    }
}
