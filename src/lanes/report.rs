use crate::core::error::CapacityExceeded;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Lane0,
    LaneA,
    LaneB,
    Bundle,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Lane0 => "lane0",
            Lane::LaneA => "lane_a",
            Lane::LaneB => "lane_b",
            Lane::Bundle => "ic_bundle",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Finished, but some items or collaborators failed.
    Partial,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Processed,
    Skipped,
    Failed,
    /// Dry runs only: would have been processed.
    Planned,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idea_id: Option<Uuid>,
    pub ticker: String,
    pub outcome: ItemOutcome,
    pub detail: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source: String,
    pub fetched: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub below_confidence: usize,
    pub malformed: usize,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lane0Summary {
    pub sources: Vec<SourceStats>,
    pub fetched: usize,
    pub duplicates: usize,
    pub below_confidence: usize,
    pub malformed: usize,
    pub over_cap: usize,
    pub forwarded: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneASummary {
    pub received: usize,
    pub selected: usize,
    pub backlog: usize,
    pub discarded: usize,
    pub enriched: usize,
    pub enrichment_failed: usize,
    pub novelty_recorded: usize,
    pub superseded: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneBSummary {
    pub candidates: usize,
    /// Duplicate tickers, and tickers researched or in flight this week.
    pub passed_over: usize,
    pub promoted: usize,
    pub complete: usize,
    pub degraded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub capacity_exceeded: usize,
    pub binding_cap: Option<CapacityExceeded>,
    pub rounds: usize,
    pub peak_in_flight: usize,
    pub daily_used: u32,
    pub weekly_used: u32,
    pub stretch: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleSummary {
    pub bundle_id: Option<Uuid>,
    pub week_label: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub included: usize,
    pub degraded: usize,
    pub excluded: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "lane", rename_all = "snake_case")]
pub enum LaneSummary {
    Lane0(Lane0Summary),
    LaneA(LaneASummary),
    LaneB(LaneBSummary),
    Bundle(BundleSummary),
}

/// Structured outcome of one lane run. Every run yields one, including
/// aborted and dry runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub lane: Lane,
    pub status: RunStatus,
    pub dry_run: bool,
    pub as_of: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub items: Vec<ItemReport>,
    pub errors: Vec<String>,
    pub summary: LaneSummary,
}

/// Accumulates items and errors while a lane runs.
pub struct ReportBuilder {
    run_id: Uuid,
    lane: Lane,
    dry_run: bool,
    as_of: DateTime<Utc>,
    started_at: DateTime<Utc>,
    started: std::time::Instant,
    items: Vec<ItemReport>,
    errors: Vec<String>,
    aborted: bool,
}

impl ReportBuilder {
    pub fn new(lane: Lane, as_of: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            lane,
            dry_run,
            as_of,
            started_at: Utc::now(),
            started: std::time::Instant::now(),
            items: Vec::new(),
            errors: Vec::new(),
            aborted: false,
        }
    }

    pub fn item(
        &mut self,
        idea_id: Option<Uuid>,
        ticker: impl Into<String>,
        outcome: ItemOutcome,
        detail: impl Into<String>,
    ) {
        self.items.push(ItemReport {
            idea_id,
            ticker: ticker.into(),
            outcome,
            detail: detail.into(),
        });
    }

    pub fn error(&mut self, err: impl fmt::Display) {
        self.errors.push(err.to_string());
    }

    pub fn abort(&mut self, err: impl fmt::Display) {
        self.error(err);
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn finish(self, summary: LaneSummary) -> RunReport {
        let count = |o: ItemOutcome| self.items.iter().filter(|i| i.outcome == o).count();
        let processed = count(ItemOutcome::Processed);
        let skipped = count(ItemOutcome::Skipped);
        let failed = count(ItemOutcome::Failed);

        let status = if self.aborted {
            RunStatus::Aborted
        } else if failed > 0 || !self.errors.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };

        metrics::counter!("lane_runs_total", "lane" => self.lane.as_str(), "status" => status.as_str())
            .increment(1);

        RunReport {
            run_id: self.run_id,
            lane: self.lane,
            status,
            dry_run: self.dry_run,
            as_of: self.as_of,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            processed,
            skipped,
            failed,
            items: self.items,
            errors: self.errors,
            summary,
        }
    }
}

impl RunReport {
    pub fn items_with(&self, outcome: ItemOutcome) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(move |i| i.outcome == outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reflects_failures_and_aborts() {
        let now = Utc::now();
        let mut b = ReportBuilder::new(Lane::Lane0, now, false);
        b.item(None, "ACME", ItemOutcome::Processed, "ok");
        let r = b.finish(LaneSummary::Lane0(Lane0Summary::default()));
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.processed, 1);

        let mut b = ReportBuilder::new(Lane::Lane0, now, false);
        b.item(None, "ACME", ItemOutcome::Failed, "boom");
        assert_eq!(
            b.finish(LaneSummary::Lane0(Lane0Summary::default())).status,
            RunStatus::Partial
        );

        let mut b = ReportBuilder::new(Lane::Lane0, now, false);
        b.abort("no sources reachable");
        let r = b.finish(LaneSummary::Lane0(Lane0Summary::default()));
        assert_eq!(r.status, RunStatus::Aborted);
        assert_eq!(r.errors, vec!["no sources reachable".to_string()]);
    }

    #[test]
    fn report_serializes_with_lane_tagged_summary() {
        let b = ReportBuilder::new(Lane::Bundle, Utc::now(), true);
        let r = b.finish(LaneSummary::Bundle(BundleSummary::default()));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["summary"]["lane"], "bundle");
        assert_eq!(v["lane"], "bundle");
        assert_eq!(v["dry_run"], true);
    }
}
