//! Lane B: promote ranked ideas into full research packets, bounded by the
//! daily and weekly caps.
//!
//! Candidates are the selected ideas in rank order followed by the backlog,
//! one idea per ticker. Tickers researched inside the weekly window, or with a
//! promotion still in flight, are passed over.
//! Work proceeds in waves: slots are reserved one at a time until a cap binds,
//! the wave runs with at most `concurrency` ideas in flight, and slots given
//! back by failed or cancelled research are reused by the next wave.

use crate::agents::catalog::{PromptContext, RESEARCH_AGENTS};
use crate::agents::runtime::{AgentAudit, AgentOutcome, AgentRuntime};
use crate::config::config::LaneBCfg;
use crate::core::error::{CapacityExceeded, PipelineError};
use crate::core::types::{
    Evidence, IdeaCard, IdeaStatus, ModuleAudit, ModuleKind, ModuleStatus, PacketFailure,
    PacketStatus, ResearchModule, ResearchPacket,
};
use futures::FutureExt;
use crate::data::{CompanyContext, DataAggregator, gather};
use crate::lanes::caps::{CapLedger, CapLimits, SlotId, local_day_start};
use crate::lanes::report::{ItemOutcome, Lane, LaneBSummary, LaneSummary, ReportBuilder, RunReport};
use crate::persistence::Store;
use crate::ranking::scoring::rank;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct LaneB {
    store: Arc<dyn Store>,
    data: Arc<dyn DataAggregator>,
    runtime: AgentRuntime,
    cfg: LaneBCfg,
    tz: Tz,
}

/// Terminal result of researching one promoted idea.
#[derive(Debug)]
enum Research {
    /// The packet is persisted. `followups` holds writes after the packet
    /// that failed; the slot stays taken regardless.
    Packet {
        packet: ResearchPacket,
        followups: Vec<String>,
    },
    /// A required module failed; `provider` is set when the cause was the
    /// LLM provider rather than invalid output.
    Aborted { failure: PacketFailure, provider: bool },
}

struct WorkResult {
    idea: IdeaCard,
    result: Result<Research, PipelineError>,
}

/// Eligible ideas in promotion order, plus the ones passed over and why.
#[derive(Debug, Default)]
struct Candidates {
    ranked: Vec<IdeaCard>,
    passed_over: Vec<(IdeaCard, &'static str)>,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

fn module_audit(audit: &AgentAudit) -> ModuleAudit {
    ModuleAudit {
        agent: audit.agent.clone(),
        model: audit.model.clone(),
        attempts: audit.attempt_count(),
        elapsed_ms: audit.elapsed.as_millis() as u64,
        total_tokens: audit.usage.total_tokens,
        completed_at: Utc::now(),
    }
}

/// Pulls the `evidence` array out of a validated module payload.
pub fn extract_evidence(
    packet_id: Uuid,
    module: ModuleKind,
    value: &Value,
    at: DateTime<Utc>,
) -> Vec<Evidence> {
    let Some(items) = value.get("evidence").and_then(Value::as_array) else {
        return Vec::new();
    };
    let field = |item: &Value, key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    items
        .iter()
        .map(|item| Evidence {
            id: Uuid::new_v4(),
            packet_id,
            module,
            source_type: field(item, "source_type"),
            reliability: field(item, "reliability"),
            claim_type: field(item, "claim_type"),
            locator: field(item, "locator"),
            recorded_at: at,
        })
        .collect()
}

impl LaneB {
    pub fn new(
        store: Arc<dyn Store>,
        data: Arc<dyn DataAggregator>,
        runtime: AgentRuntime,
        cfg: LaneBCfg,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            data,
            runtime,
            cfg,
            tz,
        }
    }

    async fn candidates(&self, researched: &[ResearchPacket]) -> anyhow::Result<Candidates> {
        let mut selected = self.store.ideas_with_status(&[IdeaStatus::Selected]).await?;
        let mut backlog = self.store.ideas_with_status(&[IdeaStatus::Backlog]).await?;
        let in_flight: HashSet<String> = self
            .store
            .ideas_with_status(&[IdeaStatus::Promoted])
            .await?
            .into_iter()
            .map(|i| i.ticker)
            .collect();
        let done: HashSet<&str> = researched.iter().map(|p| p.ticker.as_str()).collect();

        rank(&mut selected);
        rank(&mut backlog);
        let mut seen = HashSet::new();
        let mut out = Candidates::default();
        for idea in selected.into_iter().chain(backlog) {
            let reason = if done.contains(idea.ticker.as_str()) {
                Some("already researched this week")
            } else if in_flight.contains(&idea.ticker) {
                Some("research already in progress")
            } else if !seen.insert(idea.ticker.clone()) {
                Some("duplicate ticker")
            } else {
                None
            };
            match reason {
                Some(reason) => out.passed_over.push((idea, reason)),
                None => out.ranked.push(idea),
            }
        }
        Ok(out)
    }

    /// Fresh ledger seeded with the packets completed inside the weekly window,
    /// returned alongside those packets.
    async fn ledger(&self, as_of: DateTime<Utc>) -> anyhow::Result<(CapLedger, Vec<ResearchPacket>)> {
        let ledger = CapLedger::new(CapLimits::from(&self.cfg), self.tz);
        let start = ledger.window_start(as_of);
        let end = local_day_start(as_of, self.tz, 0) + Duration::days(1);
        let packets = self.store.packets_completed_between(start, end).await?;
        ledger.hydrate(packets.iter().map(|p| p.completed_at));
        Ok((ledger, packets))
    }

    /// Puts a promoted idea back to where it was before promotion.
    async fn revert(&self, mut idea: IdeaCard, previous: IdeaStatus, reason: String, as_of: DateTime<Utc>) {
        idea.transition(previous, Some(reason), as_of);
        if let Err(e) = self.store.upsert_idea(&idea).await {
            error!(ticker = %idea.ticker, error = %e, "Failed to revert promotion");
        }
    }

    /// Gathers data, promotes and runs every research module for one idea.
    async fn research(
        &self,
        idea: &IdeaCard,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Research, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let company: CompanyContext = gather(self.data.as_ref(), &idea.ticker)
            .await?
            .ok_or_else(|| {
                PipelineError::Configuration(format!("no company data for {}", idea.ticker))
            })?;

        let mut promoted = idea.clone();
        promoted.transition(IdeaStatus::Promoted, None, as_of);
        self.store.upsert_idea(&promoted).await?;
        metrics::counter!("lane_b_promotions_total").increment(1);

        match self.run_modules(&mut promoted, &company, as_of, cancel).await {
            Ok(research) => Ok(research),
            Err(e) => {
                let reason = match &e {
                    PipelineError::Cancelled => "research cancelled".to_string(),
                    other => format!("research interrupted: {other}"),
                };
                self.revert(promoted, idea.status, reason, as_of).await;
                Err(e)
            }
        }
    }

    /// Runs the research modules for an idea already marked promoted. Any
    /// error returned leaves no packet behind.
    async fn run_modules(
        &self,
        promoted: &mut IdeaCard,
        company: &CompanyContext,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Research, PipelineError> {
        let packet_id = Uuid::new_v4();
        let mut modules = Vec::with_capacity(RESEARCH_AGENTS.len());
        let mut evidence = Vec::new();

        for agent in RESEARCH_AGENTS.iter() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let Some(kind) = agent.module else {
                continue;
            };
            let ctx = PromptContext {
                idea: &*promoted,
                company: Some(company),
            };
            let outcome = self.runtime.run(agent, &ctx).await;
            let audit = module_audit(outcome.audit());

            let (errors, provider) = match outcome {
                AgentOutcome::Success { value, .. } => {
                    evidence.extend(extract_evidence(packet_id, kind, &value, as_of));
                    modules.push(ResearchModule {
                        kind,
                        status: ModuleStatus::Validated,
                        content: Some(value),
                        errors: Vec::new(),
                        audit,
                    });
                    continue;
                }
                AgentOutcome::Failed { errors, .. } => (errors, None),
                AgentOutcome::ProviderFailed { error, .. } => (Vec::new(), Some(error)),
            };

            if agent.required {
                let reason = match &provider {
                    Some(e) => format!("{kind}: {e}"),
                    None => format!("{kind}: output invalid after {} attempt(s)", audit.attempts),
                };
                let failure = PacketFailure {
                    id: Uuid::new_v4(),
                    idea_id: promoted.id,
                    ticker: promoted.ticker.clone(),
                    module: Some(kind),
                    reason: reason.clone(),
                    failed_at: as_of,
                };
                self.store.save_failure(&failure).await?;
                promoted.transition(IdeaStatus::Failed, Some(reason), as_of);
                self.store.upsert_idea(promoted).await?;
                return Ok(Research::Aborted {
                    failure,
                    provider: provider.is_some(),
                });
            }

            warn!(ticker = %promoted.ticker, module = %kind, "Optional module degraded");
            modules.push(ResearchModule {
                kind,
                status: ModuleStatus::Degraded,
                content: None,
                errors,
                audit,
            });
        }

        let status = if modules.iter().any(|m| m.status == ModuleStatus::Degraded) {
            PacketStatus::Degraded
        } else {
            PacketStatus::Complete
        };
        let packet = ResearchPacket {
            id: packet_id,
            idea_id: promoted.id,
            ticker: promoted.ticker.clone(),
            status,
            modules,
            completed_at: as_of,
        };
        self.store.save_packet(&packet).await?;

        // The packet counts from here on, whatever happens to the writes below.
        let mut followups = Vec::new();
        if let Err(e) = self.store.append_evidence(&evidence).await {
            error!(ticker = %packet.ticker, error = %e, "Failed to append evidence");
            followups.push(format!("evidence: {e:#}"));
        }
        promoted.transition(IdeaStatus::Researched, None, as_of);
        if let Err(e) = self.store.upsert_idea(promoted).await {
            error!(ticker = %packet.ticker, error = %e, "Failed to mark idea researched");
            followups.push(format!("idea status: {e:#}"));
        }
        Ok(Research::Packet { packet, followups })
    }

    fn dry_run(
        &self,
        ledger: &CapLedger,
        candidates: Vec<IdeaCard>,
        as_of: DateTime<Utc>,
        stretch: bool,
        report: &mut ReportBuilder,
        summary: &mut LaneBSummary,
    ) {
        let (free, binding) = ledger.headroom(as_of, stretch);
        for (i, idea) in candidates.iter().enumerate() {
            if i < free as usize {
                report.item(
                    Some(idea.id),
                    &idea.ticker,
                    ItemOutcome::Planned,
                    format!("would promote (score {:.3})", idea.score_value()),
                );
            } else {
                summary.capacity_exceeded += 1;
                report.item(Some(idea.id), &idea.ticker, ItemOutcome::Skipped, binding.to_string());
            }
        }
        if candidates.len() > free as usize {
            summary.binding_cap = Some(binding);
        }
    }

    #[instrument(name = "lane_b", skip(self, cancel))]
    pub async fn run(
        &self,
        as_of: DateTime<Utc>,
        stretch: bool,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> RunReport {
        let mut report = ReportBuilder::new(Lane::LaneB, as_of, dry_run);
        let mut summary = LaneBSummary {
            stretch,
            ..LaneBSummary::default()
        };

        let prepared = async {
            let (ledger, packets) = self.ledger(as_of).await?;
            let candidates = self.candidates(&packets).await?;
            Ok::<_, anyhow::Error>((candidates, ledger))
        };
        let (Candidates { ranked: candidates, passed_over }, ledger) = match prepared.await {
            Ok(v) => v,
            Err(e) => {
                report.abort(format!("store: {e:#}"));
                return report.finish(LaneSummary::LaneB(summary));
            }
        };
        summary.candidates = candidates.len();
        summary.passed_over = passed_over.len();
        for (idea, reason) in passed_over {
            debug!(ticker = %idea.ticker, reason, "Passed over");
            report.item(Some(idea.id), &idea.ticker, ItemOutcome::Skipped, reason);
        }

        if dry_run {
            self.dry_run(&ledger, candidates, as_of, stretch, &mut report, &mut summary);
            let usage = ledger.usage(as_of);
            summary.daily_used = usage.day;
            summary.weekly_used = usage.week;
            return report.finish(LaneSummary::LaneB(summary));
        }

        let ledger = Arc::new(ledger);
        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut queue: VecDeque<IdeaCard> = candidates.into();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut wave: Vec<(IdeaCard, SlotId)> = Vec::new();
            while let Some(idea) = queue.pop_front() {
                match ledger.try_reserve(as_of, stretch) {
                    Ok(slot) => wave.push((idea, slot)),
                    Err(cap) => {
                        summary.binding_cap = Some(cap);
                        queue.push_front(idea);
                        break;
                    }
                }
            }
            if wave.is_empty() {
                break;
            }
            summary.rounds += 1;
            debug!(round = summary.rounds, size = wave.len(), "Starting research wave");

            let mut set = JoinSet::new();
            for (idea, slot) in wave {
                let lane = self.clone();
                let ledger = ledger.clone();
                let semaphore = semaphore.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let cancel = cancel.clone();
                let span = info_span!("research", ticker = %idea.ticker);
                set.spawn(
                    async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            ledger.release(slot);
                            return WorkResult {
                                idea,
                                result: Err(PipelineError::Cancelled),
                            };
                        };
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);

                        let result = match AssertUnwindSafe(lane.research(&idea, as_of, &cancel))
                            .catch_unwind()
                            .await
                        {
                            Ok(result) => result,
                            Err(panic) => {
                                let msg = panic_message(panic.as_ref());
                                error!(ticker = %idea.ticker, %msg, "Research panicked");
                                lane.revert(idea.clone(), idea.status, "research panicked".into(), as_of)
                                    .await;
                                Err(PipelineError::Panicked(msg))
                            }
                        };

                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        if !matches!(result, Ok(Research::Packet { .. })) {
                            ledger.release(slot);
                        }
                        WorkResult { idea, result }
                    }
                    .instrument(span),
                );
            }

            let mut wave_size = 0;
            let mut provider_failures = 0;
            while let Some(joined) = set.join_next().await {
                wave_size += 1;
                let WorkResult { idea, result } = match joined {
                    Ok(w) => w,
                    Err(e) => {
                        error!(error = %e, "Research task panicked");
                        report.error(format!("research task: {e}"));
                        continue;
                    }
                };
                match result {
                    Ok(Research::Packet { packet, followups }) => {
                        summary.promoted += 1;
                        for f in followups {
                            report.error(format!("{}: {f}", idea.ticker));
                        }
                        let detail = match packet.status {
                            PacketStatus::Complete => {
                                summary.complete += 1;
                                format!("packet {} complete", packet.id)
                            }
                            PacketStatus::Degraded => {
                                summary.degraded += 1;
                                format!("packet {} degraded", packet.id)
                            }
                        };
                        report.item(Some(idea.id), &idea.ticker, ItemOutcome::Processed, detail);
                    }
                    Ok(Research::Aborted { failure, provider }) => {
                        summary.promoted += 1;
                        summary.failed += 1;
                        if provider {
                            provider_failures += 1;
                        }
                        report.item(Some(idea.id), &idea.ticker, ItemOutcome::Failed, failure.reason);
                    }
                    Err(PipelineError::Cancelled) => {
                        summary.cancelled += 1;
                        report.item(Some(idea.id), &idea.ticker, ItemOutcome::Skipped, "cancelled");
                    }
                    Err(PipelineError::Configuration(msg)) => {
                        summary.skipped += 1;
                        report.item(Some(idea.id), &idea.ticker, ItemOutcome::Skipped, msg);
                    }
                    Err(e @ PipelineError::Provider(_)) => {
                        provider_failures += 1;
                        summary.failed += 1;
                        report.item(Some(idea.id), &idea.ticker, ItemOutcome::Failed, e.to_string());
                    }
                    Err(e) => {
                        summary.failed += 1;
                        report.item(Some(idea.id), &idea.ticker, ItemOutcome::Failed, e.to_string());
                    }
                }
            }

            if wave_size > 0 && provider_failures == wave_size {
                error!(round = summary.rounds, "Every idea in the wave hit a provider failure");
                report.abort("provider unavailable: every idea in the wave failed");
                break;
            }
        }

        let leftover = if cancel.is_cancelled() {
            if !report.is_aborted() {
                report.abort("cancelled");
            }
            "cancelled".to_string()
        } else if report.is_aborted() {
            "run aborted".to_string()
        } else {
            summary
                .binding_cap
                .map(|c: CapacityExceeded| c.to_string())
                .unwrap_or_default()
        };
        for idea in queue {
            if summary.binding_cap.is_some() && !report.is_aborted() {
                summary.capacity_exceeded += 1;
            }
            report.item(Some(idea.id), &idea.ticker, ItemOutcome::Skipped, leftover.clone());
        }

        let usage = ledger.usage(as_of);
        summary.daily_used = usage.day;
        summary.weekly_used = usage.week;
        summary.peak_in_flight = peak.load(Ordering::SeqCst);

        info!(
            promoted = summary.promoted,
            complete = summary.complete,
            degraded = summary.degraded,
            failed = summary.failed,
            capacity_exceeded = summary.capacity_exceeded,
            daily_used = summary.daily_used,
            weekly_used = summary.weekly_used,
            "Lane B promotion complete"
        );
        report.finish(LaneSummary::LaneB(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::LlmCfg;
    use crate::core::error::CapKind;
    use crate::core::types::{
        ConfidenceTier, Direction, IcBundle, IdeaSignals, NoveltyRecord, SourceDescriptor, SourceKind,
    };
    use crate::data::simulator::SimDataAggregator;
    use crate::lanes::report::RunStatus;
    use crate::llm::simulator::{Scripted, ScriptedLlm};
    use crate::persistence::memory::MemoryStore;
    use crate::sources::simulator::ticker_for;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicBool;

    fn friday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 16, 0, 0).unwrap()
    }

    fn idea(ticker: &str, status: IdeaStatus, at: DateTime<Utc>) -> IdeaCard {
        IdeaCard {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            direction: Direction::Long,
            thesis: "thesis".into(),
            confidence: ConfidenceTier::High,
            source: SourceDescriptor {
                name: "alpha".into(),
                kind: SourceKind::Simulated,
            },
            corroborating_sources: vec![],
            style: "value".into(),
            status,
            status_reason: None,
            signals: IdeaSignals::default(),
            score: None,
            first_seen_at: at,
            created_at: at,
            updated_at: at,
        }
    }

    fn old_packet(at: DateTime<Utc>) -> ResearchPacket {
        ResearchPacket {
            id: Uuid::new_v4(),
            idea_id: Uuid::new_v4(),
            ticker: "OLD".into(),
            status: PacketStatus::Complete,
            modules: vec![],
            completed_at: at,
        }
    }

    async fn store_with(n: usize, status: IdeaStatus, at: DateTime<Utc>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..n {
            store.upsert_idea(&idea(&ticker_for("LB", i), status, at)).await.unwrap();
        }
        store
    }

    fn lane(store: Arc<MemoryStore>, llm: ScriptedLlm, data: SimDataAggregator, cfg: LaneBCfg) -> LaneB {
        LaneB::new(
            store,
            Arc::new(data),
            AgentRuntime::new(Arc::new(llm), LlmCfg::default()),
            cfg,
            chrono_tz::America::New_York,
        )
    }

    fn summary(report: &RunReport) -> &LaneBSummary {
        match &report.summary {
            LaneSummary::LaneB(s) => s,
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[tokio::test]
    async fn weekly_cap_leaves_a_single_slot() {
        let as_of = friday_noon();
        let store = store_with(120, IdeaStatus::Selected, as_of).await;
        for _ in 0..9 {
            store.save_packet(&old_packet(as_of - Duration::days(2))).await.unwrap();
        }
        let lane = lane(
            store.clone(),
            ScriptedLlm::canned(),
            SimDataAggregator::synthesizing(),
            LaneBCfg::default(),
        );

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(s.promoted, 1);
        assert_eq!(s.complete, 1);
        assert_eq!(s.capacity_exceeded, 119);
        assert_eq!(s.binding_cap.map(|c| c.kind), Some(CapKind::WeeklyMax));
        assert_eq!(s.weekly_used, 10);
        assert_eq!(store.ideas_with_status(&[IdeaStatus::Researched]).await.unwrap().len(), 1);
        let packets = store
            .packets_completed_between(as_of, as_of + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].modules.len(), 8);
        assert!(!store.evidence_for_packet(packets[0].id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn daily_target_binds_unless_stretching() {
        let as_of = friday_noon();
        let store = store_with(10, IdeaStatus::Selected, as_of).await;
        let lane = lane(
            store.clone(),
            ScriptedLlm::canned(),
            SimDataAggregator::synthesizing(),
            LaneBCfg::default(),
        );

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);
        assert_eq!(s.promoted, 3);
        assert_eq!(s.binding_cap.map(|c| c.kind), Some(CapKind::DailyTarget));

        let report = lane.run(as_of, true, false, &CancellationToken::new()).await;
        let s = summary(&report);
        assert_eq!(s.promoted, 1);
        assert_eq!(s.daily_used, 4);
        assert_eq!(s.binding_cap.map(|c| c.kind), Some(CapKind::DailyMax));
    }

    #[tokio::test]
    async fn concurrency_stays_bounded() {
        let as_of = friday_noon();
        let store = store_with(12, IdeaStatus::Selected, as_of).await;
        let cfg = LaneBCfg {
            daily_target: 8,
            daily_max: 10,
            weekly_max: 20,
            concurrency: 3,
        };
        let llm = ScriptedLlm::canned().with_delay(std::time::Duration::from_millis(5));
        let lane = lane(store, llm, SimDataAggregator::synthesizing(), cfg);

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);
        assert_eq!(s.promoted, 8);
        assert!(s.peak_in_flight <= 3, "peak was {}", s.peak_in_flight);
        assert!(s.peak_in_flight >= 1);
    }

    #[tokio::test]
    async fn selected_ideas_go_before_backlog() {
        let as_of = friday_noon();
        let store = store_with(4, IdeaStatus::Backlog, as_of).await;
        let chosen = idea("PICK", IdeaStatus::Selected, as_of);
        store.upsert_idea(&chosen).await.unwrap();
        let lane = lane(
            store.clone(),
            ScriptedLlm::canned(),
            SimDataAggregator::synthesizing(),
            LaneBCfg::default(),
        );

        lane.run(as_of, false, false, &CancellationToken::new()).await;

        let researched = store.ideas_with_status(&[IdeaStatus::Researched]).await.unwrap();
        assert_eq!(researched.len(), 3);
        assert!(researched.iter().any(|i| i.id == chosen.id));
        assert_eq!(store.ideas_with_status(&[IdeaStatus::Backlog]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn required_module_failure_writes_packet_failure() {
        let as_of = friday_noon();
        let store = store_with(1, IdeaStatus::Selected, as_of).await;
        let llm = ScriptedLlm::canned();
        llm.push_route("financial_forensics", Scripted::Reply("{}".into()));
        llm.push_route("financial_forensics", Scripted::Reply("{}".into()));
        let lane = lane(store.clone(), llm, SimDataAggregator::synthesizing(), LaneBCfg::default());

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(s.failed, 1);
        assert_eq!(s.daily_used, 0);
        let failures = store
            .failures_between(as_of, as_of + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].module, Some(ModuleKind::FinancialForensics));
        assert_eq!(store.ideas_with_status(&[IdeaStatus::Failed]).await.unwrap().len(), 1);
        assert!(
            store
                .packets_completed_between(as_of, as_of + Duration::seconds(1))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn failed_slot_is_backfilled_from_the_queue() {
        let as_of = friday_noon();
        let store = store_with(5, IdeaStatus::Selected, as_of).await;
        let llm = ScriptedLlm::canned();
        llm.push_route("business_model", Scripted::Reply("{}".into()));
        llm.push_route("business_model", Scripted::Reply("{}".into()));
        let cfg = LaneBCfg {
            concurrency: 1,
            ..LaneBCfg::default()
        };
        let lane = lane(store.clone(), llm, SimDataAggregator::synthesizing(), cfg);

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(s.failed, 1);
        assert_eq!(s.complete, 3);
        assert_eq!(s.rounds, 2);
        assert_eq!(s.daily_used, 3);
    }

    #[tokio::test]
    async fn optional_module_failure_degrades_packet() {
        let as_of = friday_noon();
        let store = store_with(1, IdeaStatus::Selected, as_of).await;
        let llm = ScriptedLlm::canned();
        llm.push_route("industry_moat", Scripted::Reply("{}".into()));
        llm.push_route("industry_moat", Scripted::Reply("not json".into()));
        let lane = lane(store.clone(), llm, SimDataAggregator::synthesizing(), LaneBCfg::default());

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(s.degraded, 1);
        let packet = &store
            .packets_completed_between(as_of, as_of + Duration::seconds(1))
            .await
            .unwrap()[0];
        assert_eq!(packet.status, PacketStatus::Degraded);
        let moat = packet.module(ModuleKind::IndustryMoat).unwrap();
        assert_eq!(moat.status, ModuleStatus::Degraded);
        assert!(moat.content.is_none());
        assert!(!moat.errors.is_empty());
        assert_eq!(moat.audit.attempts, 2);
    }

    #[tokio::test]
    async fn missing_company_data_skips_without_using_a_slot() {
        let as_of = friday_noon();
        let store = store_with(2, IdeaStatus::Selected, as_of).await;
        let data = SimDataAggregator::new().with_profile(&ticker_for("LB", 1));
        let lane = lane(store.clone(), ScriptedLlm::canned(), data, LaneBCfg::default());

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(s.skipped, 1);
        assert_eq!(s.complete, 1);
        assert_eq!(s.daily_used, 1);
        let waiting = store.ideas_with_status(&[IdeaStatus::Selected]).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].ticker, ticker_for("LB", 0));
    }

    #[tokio::test]
    async fn cancellation_between_modules_leaves_no_packet() {
        let as_of = friday_noon();
        let store = store_with(1, IdeaStatus::Selected, as_of).await;
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        let llm = ScriptedLlm::new().with_fallback(move |messages| {
            let heading = messages[0].content.lines().next().unwrap_or_default();
            let agent = heading.trim_start_matches("# ");
            if agent == "valuation" {
                trip.cancel();
            }
            Scripted::Reply(crate::llm::simulator::canned_reply(agent).unwrap().to_string())
        });
        let lane = lane(store.clone(), llm, SimDataAggregator::synthesizing(), LaneBCfg::default());

        let report = lane.run(as_of, false, false, &cancel).await;
        let s = summary(&report);

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(s.cancelled, 1);
        assert_eq!(s.daily_used, 0);
        assert!(
            store
                .packets_completed_between(as_of, as_of + Duration::seconds(1))
                .await
                .unwrap()
                .is_empty()
        );
        let idea = &store.ideas_with_status(&[IdeaStatus::Selected]).await.unwrap()[0];
        assert_eq!(idea.status_reason.as_deref(), Some("research cancelled"));
    }

    #[tokio::test]
    async fn provider_outage_aborts_the_run() {
        let as_of = friday_noon();
        let store = store_with(5, IdeaStatus::Selected, as_of).await;
        let lane = lane(
            store.clone(),
            ScriptedLlm::new(),
            SimDataAggregator::synthesizing(),
            LaneBCfg::default(),
        );

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(s.rounds, 1);
        assert_eq!(s.failed, 3);
        assert_eq!(report.items_with(ItemOutcome::Skipped).count(), 2);
    }

    #[tokio::test]
    async fn dry_run_plans_within_headroom() {
        let as_of = friday_noon();
        let store = store_with(6, IdeaStatus::Selected, as_of).await;
        let llm = Arc::new(ScriptedLlm::canned());
        let lane = LaneB::new(
            store.clone(),
            Arc::new(SimDataAggregator::synthesizing()),
            AgentRuntime::new(llm.clone(), LlmCfg::default()),
            LaneBCfg::default(),
            chrono_tz::America::New_York,
        );

        let report = lane.run(as_of, false, true, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(report.items_with(ItemOutcome::Planned).count(), 3);
        assert_eq!(s.capacity_exceeded, 3);
        assert_eq!(llm.call_count(), 0);
        assert_eq!(store.ideas_with_status(&[IdeaStatus::Selected]).await.unwrap().len(), 6);
    }

    #[test]
    fn evidence_is_extracted_per_module() {
        let value = serde_json::json!({
            "evidence": [
                {"source_type": "filing", "reliability": "A", "claim_type": "fact", "locator": "10-K p.4"},
                {"source_type": "news", "reliability": "C", "claim_type": "opinion", "locator": "WSJ"}
            ]
        });
        let packet = Uuid::new_v4();
        let ev = extract_evidence(packet, ModuleKind::Valuation, &value, friday_noon());
        assert_eq!(ev.len(), 2);
        assert!(ev.iter().all(|e| e.packet_id == packet && e.module == ModuleKind::Valuation));
        assert_eq!(ev[1].locator, "WSJ");
        assert!(extract_evidence(packet, ModuleKind::Valuation, &serde_json::json!({}), friday_noon()).is_empty());
    }

    /// Memory store that fails selected writes once.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_evidence: AtomicBool,
        fail_packet: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Store for FlakyStore {
        async fn upsert_idea(&self, idea: &IdeaCard) -> anyhow::Result<()> {
            self.inner.upsert_idea(idea).await
        }
        async fn get_idea(&self, id: Uuid) -> anyhow::Result<Option<IdeaCard>> {
            self.inner.get_idea(id).await
        }
        async fn ideas_with_status(&self, statuses: &[IdeaStatus]) -> anyhow::Result<Vec<IdeaCard>> {
            self.inner.ideas_with_status(statuses).await
        }
        async fn save_packet(&self, packet: &ResearchPacket) -> anyhow::Result<()> {
            if self.fail_packet.swap(false, Ordering::SeqCst) {
                anyhow::bail!("packet write refused");
            }
            self.inner.save_packet(packet).await
        }
        async fn get_packet(&self, id: Uuid) -> anyhow::Result<Option<ResearchPacket>> {
            self.inner.get_packet(id).await
        }
        async fn packets_completed_between(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> anyhow::Result<Vec<ResearchPacket>> {
            self.inner.packets_completed_between(start, end).await
        }
        async fn append_evidence(&self, evidence: &[Evidence]) -> anyhow::Result<()> {
            if self.fail_evidence.swap(false, Ordering::SeqCst) {
                anyhow::bail!("evidence write refused");
            }
            self.inner.append_evidence(evidence).await
        }
        async fn evidence_for_packet(&self, packet_id: Uuid) -> anyhow::Result<Vec<Evidence>> {
            self.inner.evidence_for_packet(packet_id).await
        }
        async fn save_failure(&self, failure: &PacketFailure) -> anyhow::Result<()> {
            self.inner.save_failure(failure).await
        }
        async fn failures_between(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> anyhow::Result<Vec<PacketFailure>> {
            self.inner.failures_between(start, end).await
        }
        async fn save_bundle(&self, bundle: &IcBundle) -> anyhow::Result<()> {
            self.inner.save_bundle(bundle).await
        }
        async fn get_bundle(&self, id: Uuid) -> anyhow::Result<Option<IcBundle>> {
            self.inner.get_bundle(id).await
        }
        async fn latest_bundle(&self) -> anyhow::Result<Option<IcBundle>> {
            self.inner.latest_bundle().await
        }
        async fn upsert_novelty(&self, record: &NoveltyRecord) -> anyhow::Result<()> {
            self.inner.upsert_novelty(record).await
        }
        async fn novelty_records(&self) -> anyhow::Result<Vec<NoveltyRecord>> {
            self.inner.novelty_records().await
        }
    }

    async fn flaky_week(store: &FlakyStore, as_of: DateTime<Utc>) {
        for _ in 0..9 {
            store.save_packet(&old_packet(as_of - Duration::days(2))).await.unwrap();
        }
        for i in 0..3 {
            store
                .upsert_idea(&idea(&ticker_for("LB", i), IdeaStatus::Selected, as_of))
                .await
                .unwrap();
        }
    }

    fn flaky_lane(store: Arc<FlakyStore>) -> LaneB {
        LaneB::new(
            store,
            Arc::new(SimDataAggregator::synthesizing()),
            AgentRuntime::new(Arc::new(ScriptedLlm::canned()), LlmCfg::default()),
            LaneBCfg::default(),
            chrono_tz::America::New_York,
        )
    }

    async fn week_packets(store: &dyn Store, as_of: DateTime<Utc>) -> usize {
        let tz = chrono_tz::America::New_York;
        store
            .packets_completed_between(
                local_day_start(as_of, tz, 6),
                local_day_start(as_of, tz, 0) + Duration::days(1),
            )
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn same_ticker_is_researched_once_per_run() {
        let as_of = friday_noon();
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_idea(&idea("ACME", IdeaStatus::Selected, as_of - Duration::days(1)))
            .await
            .unwrap();
        store.upsert_idea(&idea("ACME", IdeaStatus::Selected, as_of)).await.unwrap();
        let lane = lane(
            store.clone(),
            ScriptedLlm::canned(),
            SimDataAggregator::synthesizing(),
            LaneBCfg::default(),
        );

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(s.promoted, 1);
        assert_eq!(s.passed_over, 1);
        let packets = store
            .packets_completed_between(as_of, as_of + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(packets.iter().filter(|p| p.ticker == "ACME").count(), 1);
        assert!(
            report
                .items_with(ItemOutcome::Skipped)
                .any(|i| i.ticker == "ACME" && i.detail == "duplicate ticker")
        );
    }

    #[tokio::test]
    async fn ticker_researched_this_week_is_passed_over() {
        let as_of = friday_noon();
        let store = Arc::new(MemoryStore::new());
        let mut earlier = old_packet(as_of - Duration::days(2));
        earlier.ticker = "ACME".into();
        store.save_packet(&earlier).await.unwrap();
        store.upsert_idea(&idea("ACME", IdeaStatus::Selected, as_of)).await.unwrap();
        store.upsert_idea(&idea("BOLT", IdeaStatus::Selected, as_of)).await.unwrap();
        let lane = lane(
            store.clone(),
            ScriptedLlm::canned(),
            SimDataAggregator::synthesizing(),
            LaneBCfg::default(),
        );

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!((s.promoted, s.passed_over), (1, 1));
        let researched = store.ideas_with_status(&[IdeaStatus::Researched]).await.unwrap();
        assert_eq!(researched.len(), 1);
        assert_eq!(researched[0].ticker, "BOLT");
    }

    #[tokio::test]
    async fn ticker_with_promotion_in_flight_is_passed_over() {
        let as_of = friday_noon();
        let store = Arc::new(MemoryStore::new());
        store.upsert_idea(&idea("ACME", IdeaStatus::Promoted, as_of)).await.unwrap();
        store.upsert_idea(&idea("ACME", IdeaStatus::Backlog, as_of)).await.unwrap();
        let llm = Arc::new(ScriptedLlm::canned());
        let lane = LaneB::new(
            store.clone(),
            Arc::new(SimDataAggregator::synthesizing()),
            AgentRuntime::new(llm.clone(), LlmCfg::default()),
            LaneBCfg::default(),
            chrono_tz::America::New_York,
        );

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!((s.promoted, s.passed_over), (0, 1));
        assert_eq!(llm.call_count(), 0);
        assert!(
            report
                .items_with(ItemOutcome::Skipped)
                .any(|i| i.detail == "research already in progress")
        );
    }

    #[tokio::test]
    async fn saved_packet_keeps_its_slot_when_evidence_write_fails() {
        let as_of = friday_noon();
        let store = Arc::new(FlakyStore::default());
        flaky_week(&store, as_of).await;
        store.fail_evidence.store(true, Ordering::SeqCst);

        let report = flaky_lane(store.clone())
            .run(as_of, false, false, &CancellationToken::new())
            .await;
        let s = summary(&report);

        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(s.promoted, 1);
        assert_eq!(s.weekly_used, 10);
        assert_eq!(week_packets(store.as_ref(), as_of).await, 10);
        assert!(store.ideas_with_status(&[IdeaStatus::Promoted]).await.unwrap().is_empty());
        assert_eq!(store.ideas_with_status(&[IdeaStatus::Researched]).await.unwrap().len(), 1);
        assert!(report.errors.iter().any(|e| e.contains("evidence")));
    }

    #[tokio::test]
    async fn failed_packet_write_reverts_the_idea_and_frees_the_slot() {
        let as_of = friday_noon();
        let store = Arc::new(FlakyStore::default());
        flaky_week(&store, as_of).await;
        store.fail_packet.store(true, Ordering::SeqCst);

        let report = flaky_lane(store.clone())
            .run(as_of, false, false, &CancellationToken::new())
            .await;
        let s = summary(&report);

        assert_eq!(s.failed, 1);
        assert_eq!(s.complete, 1);
        assert_eq!(s.weekly_used, 10);
        assert_eq!(week_packets(store.as_ref(), as_of).await, 10);
        assert!(store.ideas_with_status(&[IdeaStatus::Promoted]).await.unwrap().is_empty());
        let waiting = store.ideas_with_status(&[IdeaStatus::Selected]).await.unwrap();
        assert!(
            waiting
                .iter()
                .any(|i| i.status_reason.as_deref().is_some_and(|r| r.starts_with("research interrupted")))
        );
    }

    #[tokio::test]
    async fn weekly_cap_holds_across_two_weeks_of_stretch_runs() {
        let tz = chrono_tz::America::New_York;
        let store = store_with(60, IdeaStatus::Selected, friday_noon()).await;
        let cfg = LaneBCfg::default();
        let lane = lane(
            store.clone(),
            ScriptedLlm::canned(),
            SimDataAggregator::synthesizing(),
            cfg.clone(),
        );
        // 08:00 New York, Monday 2026-10-19 through Friday 2026-10-30
        let days: Vec<DateTime<Utc>> = [19, 20, 21, 22, 23, 26, 27, 28, 29, 30]
            .into_iter()
            .map(|d| Utc.with_ymd_and_hms(2026, 10, d, 12, 0, 0).unwrap())
            .collect();

        for (i, as_of) in days.iter().enumerate() {
            let report = lane.run(*as_of, true, false, &CancellationToken::new()).await;
            assert_ne!(report.status, RunStatus::Aborted);

            let trailing = week_packets(store.as_ref(), *as_of).await;
            assert!(trailing <= cfg.weekly_max as usize, "{trailing} packets in week ending {as_of}");
            if i >= 4 {
                let five_weekdays = store
                    .packets_completed_between(
                        local_day_start(days[i - 4], tz, 0),
                        local_day_start(*as_of, tz, 0) + Duration::days(1),
                    )
                    .await
                    .unwrap()
                    .len();
                assert!(five_weekdays <= cfg.weekly_max as usize);
            }
        }

        let total = store
            .packets_completed_between(days[0], days[9] + Duration::days(1))
            .await
            .unwrap()
            .len();
        assert!(total > cfg.weekly_max as usize);
    }

    #[tokio::test]
    async fn panicking_research_is_reported_and_reverted() {
        let as_of = friday_noon();
        let store = store_with(1, IdeaStatus::Selected, as_of).await;
        let llm = ScriptedLlm::new().with_fallback(|_| panic!("model exploded"));
        let lane = lane(store.clone(), llm, SimDataAggregator::synthesizing(), LaneBCfg::default());

        let report = lane.run(as_of, false, false, &CancellationToken::new()).await;
        let s = summary(&report);

        assert_eq!(s.failed, 1);
        assert_eq!(s.daily_used, 0);
        let failed: Vec<_> = report.items_with(ItemOutcome::Failed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].ticker, ticker_for("LB", 0));
        assert!(failed[0].detail.contains("model exploded"));
        let idea = &store.ideas_with_status(&[IdeaStatus::Selected]).await.unwrap()[0];
        assert_eq!(idea.status_reason.as_deref(), Some("research panicked"));
    }
}
