//! Lane 0: fan out to every idea source, fan the results back in as a single
//! deduplicated, confidence-filtered and capped worklist for Lane A.

use crate::config::config::Lane0Cfg;
use crate::core::error::ProviderError;
use crate::core::types::{IdeaCard, IdeaStatus};
use crate::lanes::report::{
    ItemOutcome, Lane, Lane0Summary, LaneSummary, ReportBuilder, RunReport, SourceStats,
};
use crate::persistence::Store;
use crate::sources::normalizers::{normalize_thesis, normalize_ticker};
use crate::sources::{IdeaSource, RawIdea};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct Lane0 {
    sources: Vec<Arc<dyn IdeaSource>>,
    store: Arc<dyn Store>,
    cfg: Lane0Cfg,
}

struct Candidate {
    raw: RawIdea,
    ticker: String,
    source_idx: usize,
    first_seen: DateTime<Utc>,
    corroborating: Vec<String>,
}

/// Outcome of fan-in before anything is persisted.
pub struct Worklist {
    pub ideas: Vec<IdeaCard>,
    pub summary: Lane0Summary,
    pub source_errors: Vec<String>,
}

impl Lane0 {
    pub fn new(sources: Vec<Arc<dyn IdeaSource>>, store: Arc<dyn Store>, cfg: Lane0Cfg) -> Self {
        Self {
            sources,
            store,
            cfg,
        }
    }

    async fn fetch_all(&self) -> Vec<Result<Vec<RawIdea>, ProviderError>> {
        let timeout = self.cfg.source_timeout;
        let fetches = self.sources.iter().map(|source| {
            let source = source.clone();
            async move {
                let name = source.descriptor().name.clone();
                match tokio::time::timeout(timeout, source.fetch()).await {
                    Ok(res) => res,
                    Err(_) => Err(ProviderError::Timeout {
                        provider: name,
                        after: timeout,
                    }),
                }
            }
        });
        futures::future::join_all(fetches).await
    }

    /// Merges fetch results in source order. Pure apart from id generation.
    pub fn merge(
        &self,
        results: Vec<Result<Vec<RawIdea>, ProviderError>>,
        as_of: DateTime<Utc>,
    ) -> Worklist {
        let mut stats: Vec<SourceStats> = self
            .sources
            .iter()
            .map(|s| SourceStats {
                source: s.descriptor().name.clone(),
                ..Default::default()
            })
            .collect();
        let mut source_errors = Vec::new();

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut by_ticker: HashMap<String, usize> = HashMap::new();

        for (idx, result) in results.into_iter().enumerate() {
            let ideas = match result {
                Ok(ideas) => ideas,
                Err(e) => {
                    warn!(source = %stats[idx].source, error = %e, "Source fetch failed");
                    stats[idx].error = Some(e.to_string());
                    source_errors.push(e.to_string());
                    continue;
                }
            };
            stats[idx].fetched = ideas.len();

            for raw in ideas {
                let Some(ticker) = normalize_ticker(&raw.ticker) else {
                    stats[idx].malformed += 1;
                    continue;
                };
                let incoming = Candidate {
                    first_seen: raw.first_seen_at.unwrap_or(as_of),
                    raw,
                    ticker: ticker.clone(),
                    source_idx: idx,
                    corroborating: Vec::new(),
                };

                let Some(&pos) = by_ticker.get(&ticker) else {
                    by_ticker.insert(ticker, candidates.len());
                    candidates.push(incoming);
                    continue;
                };

                // Highest confidence wins; ties keep the earlier copy.
                let existing = &mut candidates[pos];
                let (winner_src, loser_src) = if incoming.raw.confidence > existing.raw.confidence
                {
                    let loser = existing.source_idx;
                    let mut corroborating = std::mem::take(&mut existing.corroborating);
                    *existing = incoming;
                    existing.corroborating = {
                        corroborating.push(stats[loser].source.clone());
                        corroborating
                    };
                    (existing.source_idx, loser)
                } else {
                    let name = stats[incoming.source_idx].source.clone();
                    existing.corroborating.push(name);
                    (existing.source_idx, incoming.source_idx)
                };
                let winner_name = stats[winner_src].source.clone();
                let mut seen = HashSet::new();
                existing
                    .corroborating
                    .retain(|s| *s != winner_name && seen.insert(s.clone()));
                stats[loser_src].duplicates += 1;
            }
        }

        candidates.retain(|c| {
            if c.raw.confidence < self.cfg.min_confidence {
                stats[c.source_idx].below_confidence += 1;
                false
            } else {
                true
            }
        });

        candidates.sort_by(|a, b| {
            b.raw
                .confidence
                .cmp(&a.raw.confidence)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        for c in &candidates {
            stats[c.source_idx].accepted += 1;
        }

        let over_cap = candidates.len().saturating_sub(self.cfg.max_ideas_to_lane_a);
        candidates.truncate(self.cfg.max_ideas_to_lane_a);

        let ideas: Vec<IdeaCard> = candidates
            .into_iter()
            .map(|c| IdeaCard {
                id: Uuid::new_v4(),
                ticker: c.ticker,
                direction: c.raw.direction,
                thesis: normalize_thesis(&c.raw.thesis),
                confidence: c.raw.confidence,
                source: self.sources[c.source_idx].descriptor().clone(),
                corroborating_sources: c.corroborating,
                style: c.raw.style.unwrap_or_else(|| "unspecified".into()),
                status: IdeaStatus::New,
                status_reason: None,
                signals: c.raw.signals,
                score: None,
                first_seen_at: c.first_seen,
                created_at: as_of,
                updated_at: as_of,
            })
            .collect();

        let summary = Lane0Summary {
            fetched: stats.iter().map(|s| s.fetched).sum(),
            duplicates: stats.iter().map(|s| s.duplicates).sum(),
            below_confidence: stats.iter().map(|s| s.below_confidence).sum(),
            malformed: stats.iter().map(|s| s.malformed).sum(),
            over_cap,
            forwarded: ideas.len(),
            sources: stats,
        };

        Worklist {
            ideas,
            summary,
            source_errors,
        }
    }

    #[instrument(name = "lane0", skip(self, cancel), fields(sources = self.sources.len()))]
    pub async fn run(
        &self,
        as_of: DateTime<Utc>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> RunReport {
        let mut report = ReportBuilder::new(Lane::Lane0, as_of, dry_run);

        if self.sources.is_empty() {
            report.abort("no idea sources configured");
            return report.finish(LaneSummary::Lane0(Lane0Summary::default()));
        }

        let results = tokio::select! {
            r = self.fetch_all() => r,
            _ = cancel.cancelled() => {
                report.abort("cancelled");
                return report.finish(LaneSummary::Lane0(Lane0Summary::default()));
            }
        };

        let all_failed = results.iter().all(|r| r.is_err());
        let worklist = self.merge(results, as_of);
        for err in &worklist.source_errors {
            report.error(err);
        }
        if all_failed {
            report.abort("every idea source failed");
            return report.finish(LaneSummary::Lane0(worklist.summary));
        }

        for idea in &worklist.ideas {
            if cancel.is_cancelled() {
                report.abort("cancelled");
                break;
            }
            if dry_run {
                report.item(Some(idea.id), &idea.ticker, ItemOutcome::Planned, "would forward");
                continue;
            }
            match self.store.upsert_idea(idea).await {
                Ok(()) => report.item(
                    Some(idea.id),
                    &idea.ticker,
                    ItemOutcome::Processed,
                    format!("forwarded from {}", idea.source.name),
                ),
                Err(e) => report.item(
                    Some(idea.id),
                    &idea.ticker,
                    ItemOutcome::Failed,
                    format!("store: {e:#}"),
                ),
            }
        }

        let s = &worklist.summary;
        info!(
            fetched = s.fetched,
            forwarded = s.forwarded,
            duplicates = s.duplicates,
            below_confidence = s.below_confidence,
            malformed = s.malformed,
            over_cap = s.over_cap,
            "Lane 0 fan-in complete"
        );
        report.finish(LaneSummary::Lane0(worklist.summary))
    }
}
