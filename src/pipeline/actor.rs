use crate::bus::types::Bus;
use crate::core::types::Actor;
use crate::lanes::report::Lane;
use crate::pipeline::orchestrator::{Pipeline, RunOptions};
use crate::pipeline::schedule::{SYSTEM_TZ, cron_for, next_fire, parse_cron};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sleeps until the lane's next cron firing, runs it, repeats.
pub struct LaneActor {
    pub pipeline: Arc<Pipeline>,
    pub lane: Lane,
    pub shutdown: CancellationToken,
}

impl LaneActor {
    pub fn new(pipeline: Arc<Pipeline>, lane: Lane, shutdown: CancellationToken) -> LaneActor {
        Self {
            pipeline,
            lane,
            shutdown,
        }
    }
}

#[async_trait::async_trait]
impl Actor for LaneActor {
    async fn run(self) -> Result<()> {
        let schedule = parse_cron(cron_for(self.lane))?;
        info!(lane = %self.lane, "LaneActor started");

        loop {
            let next = next_fire(&schedule, Utc::now(), SYSTEM_TZ)?;
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            info!(lane = %self.lane, next = %next.with_timezone(&SYSTEM_TZ), "Next firing scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(lane = %self.lane, "LaneActor: shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    let opts = RunOptions { as_of: next, ..RunOptions::now() };
                    // shutdown cancels an in-flight run too
                    let report = self.pipeline.run(self.lane, opts, &self.shutdown).await;
                    info!(lane = %self.lane, status = report.status.as_str(), duration_ms = report.duration_ms, "Scheduled run finished");
                }
            }
        }

        info!(lane = %self.lane, "LaneActor stopped cleanly");
        Ok(())
    }
}

/// Emits every published run report as one structured log line.
pub struct ReportActor {
    pub bus: Bus,
    pub shutdown: CancellationToken,
}

impl ReportActor {
    pub fn new(bus: Bus, shutdown: CancellationToken) -> ReportActor {
        Self { bus, shutdown }
    }
}

#[async_trait::async_trait]
impl Actor for ReportActor {
    async fn run(self) -> Result<()> {
        info!("ReportActor started");
        let mut rx = self.bus.run_reports.subscribe();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("ReportActor: shutdown requested");
                    break;
                }
                res = rx.recv() => {
                    match res {
                        Ok(report) => match serde_json::to_string(report.as_ref()) {
                            Ok(json) => info!(lane = %report.lane, report = %json, "Run report"),
                            Err(e) => error!(?e, "Failed to serialize run report"),
                        },
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("ReportActor lagged by {n} run reports");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("ReportActor run_reports channel closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("ReportActor stopped cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::AppCfg;
    use crate::data::simulator::SimDataAggregator;
    use crate::llm::simulator::ScriptedLlm;
    use crate::persistence::memory::MemoryStore;
    use crate::pipeline::orchestrator::Collaborators;
    use std::time::Duration;

    async fn pipeline(bus: Bus) -> Arc<Pipeline> {
        let c = Collaborators {
            store: Arc::new(MemoryStore::new()),
            sources: vec![],
            data: Arc::new(SimDataAggregator::new()),
            llm: Arc::new(ScriptedLlm::new()),
        };
        Arc::new(Pipeline::build(&AppCfg::default(), c, bus).await.unwrap())
    }

    #[tokio::test]
    async fn lane_actor_exits_on_shutdown() {
        let shutdown = CancellationToken::new();
        let actor = LaneActor::new(pipeline(Bus::new()).await, Lane::Bundle, shutdown.clone());
        let handle = tokio::spawn(actor.run());
        shutdown.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(res, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn report_actor_drains_until_shutdown() {
        let bus = Bus::new();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(ReportActor::new(bus.clone(), shutdown.clone()).run());
        let p = pipeline(bus).await;
        p.run(Lane::Bundle, RunOptions::now(), &CancellationToken::new()).await;
        shutdown.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(res, Ok(Ok(Ok(())))));
    }
}
