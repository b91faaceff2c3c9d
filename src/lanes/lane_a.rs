//! Lane A: score and rank the day's Lane 0 output, then gate it into
//! selected / backlog / discarded.
//!
//! Each run replaces the previous one: selected and backlog ideas left over
//! from an earlier run are discarded as superseded, so Lane B only ever sees
//! scores computed today.

use crate::agents::catalog::{IDEA_ENRICHMENT, PromptContext};
use crate::agents::runtime::{AgentOutcome, AgentRuntime};
use crate::config::config::LaneACfg;
use crate::core::types::{IdeaCard, IdeaSignals, IdeaStatus};
use crate::data::DataAggregator;
use crate::lanes::report::{ItemOutcome, Lane, LaneASummary, LaneSummary, ReportBuilder, RunReport};
use crate::persistence::Store;
use crate::ranking::novelty::NoveltyStore;
use crate::ranking::quality::quality_prior;
use crate::ranking::scoring::{Scorer, rank};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct LaneA {
    store: Arc<dyn Store>,
    scorer: Scorer,
    novelty: Arc<NoveltyStore>,
    runtime: Option<AgentRuntime>,
    data: Option<Arc<dyn DataAggregator>>,
    cfg: LaneACfg,
}

/// Ranked ideas split by the target and cap gates.
#[derive(Debug, Default)]
pub struct Partition {
    pub selected: Vec<IdeaCard>,
    pub backlog: Vec<IdeaCard>,
    pub discarded: Vec<IdeaCard>,
}

/// Top `target` are selected, the next ones up to `cap` go to the backlog and
/// the rest are discarded. Input must already be ranked.
pub fn partition(ranked: Vec<IdeaCard>, target: usize, cap: usize) -> Partition {
    let mut p = Partition::default();
    for (i, idea) in ranked.into_iter().enumerate() {
        if i < target {
            p.selected.push(idea);
        } else if i < cap {
            p.backlog.push(idea);
        } else {
            p.discarded.push(idea);
        }
    }
    p
}

fn signals_from(value: &Value) -> IdeaSignals {
    let get = |k: &str| value.get(k).and_then(Value::as_f64);
    IdeaSignals {
        edge_clarity: get("edge_clarity"),
        valuation_tension: get("valuation_tension"),
        catalyst_timing: get("catalyst_timing"),
        business_quality: get("business_quality"),
        disclosure_friction: get("disclosure_friction"),
    }
}

impl LaneA {
    pub fn new(
        store: Arc<dyn Store>,
        scorer: Scorer,
        novelty: Arc<NoveltyStore>,
        cfg: LaneACfg,
    ) -> Self {
        Self {
            store,
            scorer,
            novelty,
            runtime: None,
            data: None,
            cfg,
        }
    }

    /// Enables the `idea_enrichment` agent when `enrich` is configured.
    pub fn with_runtime(mut self, runtime: AgentRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Enables the statement-based quality prior when configured.
    pub fn with_data(mut self, data: Arc<dyn DataAggregator>) -> Self {
        self.data = Some(data);
        self
    }

    async fn apply_fundamentals(&self, ideas: &mut [IdeaCard]) {
        let Some(data) = self.data.as_ref().filter(|_| self.cfg.fundamentals_prior) else {
            return;
        };
        let lookups = ideas.iter().map(|idea| {
            let data = data.clone();
            let ticker = idea.ticker.clone();
            let wanted = idea.signals.business_quality.is_none();
            async move {
                if !wanted {
                    return None;
                }
                match data.statements(&ticker).await {
                    Ok(res) => res.data.as_ref().and_then(quality_prior),
                    Err(e) => {
                        debug!(%ticker, error = %e, "Statements unavailable for quality prior");
                        None
                    }
                }
            }
        }).collect::<Vec<_>>();
        let priors: Vec<Option<f64>> = futures::stream::iter(lookups)
            .buffered(self.cfg.enrich_concurrency.max(1))
            .collect()
            .await;
        for (idea, prior) in ideas.iter_mut().zip(priors) {
            if prior.is_some() {
                idea.signals.business_quality = prior;
            }
        }
    }

    /// Runs enrichment over `selected`, rescoring every idea that validates.
    /// Returns the failures as `(ticker, reason)`.
    async fn enrich(
        &self,
        runtime: &AgentRuntime,
        selected: &mut [IdeaCard],
        as_of: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let calls = selected.iter().map(|idea| async move {
            let ctx = PromptContext {
                idea,
                company: None,
            };
            runtime.run(&IDEA_ENRICHMENT, &ctx).await
        }).collect::<Vec<_>>();
        let outcomes: Vec<AgentOutcome> = futures::stream::iter(calls)
            .buffered(self.cfg.enrich_concurrency.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        for (idea, outcome) in selected.iter_mut().zip(outcomes) {
            match outcome {
                AgentOutcome::Success { value, .. } => {
                    idea.signals = signals_from(&value);
                    idea.score = Some(self.scorer.score(idea, &self.novelty, as_of));
                }
                AgentOutcome::Failed { errors, .. } => {
                    failures.push((
                        idea.ticker.clone(),
                        format!("enrichment invalid after retries ({} error(s))", errors.len()),
                    ));
                }
                AgentOutcome::ProviderFailed { error, .. } => {
                    failures.push((idea.ticker.clone(), format!("enrichment provider error: {error}")));
                }
            }
        }
        failures
    }

    /// Discards what earlier runs left selected or in the backlog.
    async fn supersede(&self, as_of: DateTime<Utc>) -> anyhow::Result<Vec<IdeaCard>> {
        let mut stale = self
            .store
            .ideas_with_status(&[IdeaStatus::Selected, IdeaStatus::Backlog])
            .await?;
        for idea in stale.iter_mut() {
            idea.transition(IdeaStatus::Discarded, Some("superseded".into()), as_of);
            self.store.upsert_idea(idea).await?;
        }
        Ok(stale)
    }

    #[instrument(name = "lane_a", skip(self, cancel))]
    pub async fn run(
        &self,
        as_of: DateTime<Utc>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> RunReport {
        let mut report = ReportBuilder::new(Lane::LaneA, as_of, dry_run);
        let mut summary = LaneASummary::default();

        let mut ideas = match self.store.ideas_with_status(&[IdeaStatus::New]).await {
            Ok(ideas) => ideas,
            Err(e) => {
                report.abort(format!("store: {e:#}"));
                return report.finish(LaneSummary::LaneA(summary));
            }
        };
        summary.received = ideas.len();

        self.apply_fundamentals(&mut ideas).await;

        for idea in ideas.iter_mut() {
            idea.score = Some(self.scorer.score(idea, &self.novelty, as_of));
        }
        rank(&mut ideas);
        let mut part = partition(ideas, self.cfg.target, self.cfg.cap);

        if let (true, Some(runtime)) = (self.cfg.enrich, self.runtime.as_ref()) {
            let failures = tokio::select! {
                f = self.enrich(runtime, &mut part.selected, as_of) => f,
                _ = cancel.cancelled() => {
                    report.abort("cancelled");
                    return report.finish(LaneSummary::LaneA(summary));
                }
            };
            // membership stays as gated on base scores; enriched scores only reorder it
            rank(&mut part.selected);
            summary.enrichment_failed = failures.len();
            summary.enriched = part.selected.len() - failures.len();
            for (ticker, reason) in failures {
                warn!(%ticker, %reason, "Enrichment failed, keeping base score");
                report.error(format!("{ticker}: {reason}"));
            }
        }

        if cancel.is_cancelled() {
            report.abort("cancelled");
            return report.finish(LaneSummary::LaneA(summary));
        }

        summary.selected = part.selected.len();
        summary.backlog = part.backlog.len();
        summary.discarded = part.discarded.len();

        if dry_run {
            for idea in &part.selected {
                report.item(
                    Some(idea.id),
                    &idea.ticker,
                    ItemOutcome::Planned,
                    format!("would select (score {:.3})", idea.score_value()),
                );
            }
            return report.finish(LaneSummary::LaneA(summary));
        }

        match self.supersede(as_of).await {
            Ok(stale) => {
                summary.superseded = stale.len();
                for idea in stale {
                    report.item(Some(idea.id), &idea.ticker, ItemOutcome::Skipped, "superseded");
                }
            }
            Err(e) => report.error(format!("superseding earlier selections: {e:#}")),
        }

        // Observations go in only after every idea has been scored.
        let received = part
            .selected
            .iter()
            .chain(&part.backlog)
            .chain(&part.discarded);
        for idea in received {
            let record = self.novelty.record_observation(&idea.ticker, as_of);
            if let Err(e) = self.store.upsert_novelty(&record).await {
                report.error(format!("{}: novelty store: {e:#}", idea.ticker));
            }
            summary.novelty_recorded += 1;
        }

        let gated = [
            (part.selected, IdeaStatus::Selected, None, ItemOutcome::Processed),
            (
                part.backlog,
                IdeaStatus::Backlog,
                Some("over target; available for backfill"),
                ItemOutcome::Skipped,
            ),
            (
                part.discarded,
                IdeaStatus::Discarded,
                Some("over cap"),
                ItemOutcome::Skipped,
            ),
        ];
        for (group, status, reason, outcome) in gated {
            for mut idea in group {
                idea.transition(status, reason.map(str::to_string), as_of);
                match self.store.upsert_idea(&idea).await {
                    Ok(()) => report.item(
                        Some(idea.id),
                        &idea.ticker,
                        outcome,
                        format!("{status} (score {:.3})", idea.score_value()),
                    ),
                    Err(e) => report.item(
                        Some(idea.id),
                        &idea.ticker,
                        ItemOutcome::Failed,
                        format!("store: {e:#}"),
                    ),
                }
            }
        }

        info!(
            received = summary.received,
            selected = summary.selected,
            backlog = summary.backlog,
            discarded = summary.discarded,
            enriched = summary.enriched,
            superseded = summary.superseded,
            "Lane A gating complete"
        );
        report.finish(LaneSummary::LaneA(summary))
    }
}
