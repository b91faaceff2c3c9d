//! Wires the lanes to their collaborators and runs them, alone or end to end.

use crate::agents::runtime::AgentRuntime;
use crate::bus::types::Bus;
use crate::config::config::AppCfg;
use crate::data::DataAggregator;
use crate::lanes::bundle::BundleAssembler;
use crate::lanes::lane0::Lane0;
use crate::lanes::lane_a::LaneA;
use crate::lanes::lane_b::LaneB;
use crate::lanes::report::{Lane, RunReport, RunStatus};
use crate::llm::LlmClient;
use crate::persistence::Store;
use crate::pipeline::schedule::SYSTEM_TZ;
use crate::ranking::novelty::NoveltyStore;
use crate::ranking::scoring::Scorer;
use crate::sources::IdeaSource;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External collaborators, real or simulated.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub sources: Vec<Arc<dyn IdeaSource>>,
    pub data: Arc<dyn DataAggregator>,
    pub llm: Arc<dyn LlmClient>,
}

#[derive(Clone, Copy, Debug)]
pub struct RunOptions {
    pub as_of: DateTime<Utc>,
    pub dry_run: bool,
    /// Lane B only: allow promotions past the daily target up to the daily max.
    pub stretch: bool,
}

impl RunOptions {
    pub fn now() -> Self {
        Self {
            as_of: Utc::now(),
            dry_run: false,
            stretch: false,
        }
    }
}

pub struct Pipeline {
    bus: Bus,
    lane0: Lane0,
    lane_a: LaneA,
    lane_b: LaneB,
    bundle: BundleAssembler,
}

impl Pipeline {
    /// Builds every lane from one validated configuration. Novelty history is
    /// hydrated from the store so ranking survives restarts.
    pub async fn build(cfg: &AppCfg, c: Collaborators, bus: Bus) -> Result<Self> {
        cfg.validate()?;

        let novelty = Arc::new(NoveltyStore::new(
            cfg.ranking.full_novelty_days,
            cfg.ranking.penalty_window_days,
        ));
        let history = c
            .store
            .novelty_records()
            .await
            .context("loading novelty history")?;
        info!(tickers = history.len(), "Hydrated novelty history");
        novelty.hydrate(history);

        let runtime = AgentRuntime::new(c.llm, cfg.llm.clone());

        let lane0 = Lane0::new(c.sources, c.store.clone(), cfg.lane0.clone());
        let lane_a = LaneA::new(
            c.store.clone(),
            Scorer::new(cfg.ranking.weights.clone()),
            novelty,
            cfg.lane_a.clone(),
        )
        .with_runtime(runtime.clone())
        .with_data(c.data.clone());
        let lane_b = LaneB::new(
            c.store.clone(),
            c.data,
            runtime,
            cfg.lane_b.clone(),
            SYSTEM_TZ,
        );
        let bundle = BundleAssembler::new(c.store, SYSTEM_TZ);

        Ok(Self {
            bus,
            lane0,
            lane_a,
            lane_b,
            bundle,
        })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Runs one lane and publishes its report.
    pub async fn run(&self, lane: Lane, opts: RunOptions, cancel: &CancellationToken) -> RunReport {
        let RunOptions {
            as_of,
            dry_run,
            stretch,
        } = opts;
        let report = match lane {
            Lane::Lane0 => self.lane0.run(as_of, dry_run, cancel).await,
            Lane::LaneA => self.lane_a.run(as_of, dry_run, cancel).await,
            Lane::LaneB => self.lane_b.run(as_of, stretch, dry_run, cancel).await,
            Lane::Bundle => self.bundle.run(as_of, dry_run, cancel).await,
        };

        match report.status {
            RunStatus::Completed => info!(%lane, run_id = %report.run_id, "Lane run completed"),
            RunStatus::Partial => warn!(%lane, run_id = %report.run_id, errors = ?report.errors, "Lane run partial"),
            RunStatus::Aborted => error!(%lane, run_id = %report.run_id, errors = ?report.errors, "Lane run aborted"),
        }
        if let Err(e) = self.bus.run_reports.publish(report.clone()).await {
            error!(?e, "publish to run_reports failed");
        }
        report
    }

    /// Lane 0, Lane A, Lane B, then the bundle. Stops after the first aborted lane.
    pub async fn run_all(&self, opts: RunOptions, cancel: &CancellationToken) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(4);
        for lane in [Lane::Lane0, Lane::LaneA, Lane::LaneB, Lane::Bundle] {
            let report = self.run(lane, opts, cancel).await;
            let aborted = report.status == RunStatus::Aborted;
            reports.push(report);
            if aborted {
                warn!(%lane, "Skipping downstream lanes after abort");
                break;
            }
        }
        reports
    }
}
