use crate::schema::validator::FieldError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[async_trait::async_trait]
pub trait Actor: Send + Sync + 'static {
    async fn run(self) -> Result<()>;
}

// ----------- Idea intake -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

/// Ordered so that `High > Medium > Low`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    /// Edge-clarity prior used when neither the source nor enrichment supplied one.
    pub fn edge_prior(self) -> f64 {
        match self {
            ConfidenceTier::Low => 0.3,
            ConfidenceTier::Medium => 0.6,
            ConfidenceTier::High => 0.9,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Screener,
    Newsletter,
    Filing,
    Manual,
    Simulated,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub kind: SourceKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeaStatus {
    New,
    Selected,
    Backlog,
    Discarded,
    Promoted,
    Researched,
    Failed,
}

impl IdeaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdeaStatus::New => "new",
            IdeaStatus::Selected => "selected",
            IdeaStatus::Backlog => "backlog",
            IdeaStatus::Discarded => "discarded",
            IdeaStatus::Promoted => "promoted",
            IdeaStatus::Researched => "researched",
            IdeaStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IdeaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw ranking inputs in [0,1]. Missing values fall back to priors at scoring time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IdeaSignals {
    #[serde(default)]
    pub edge_clarity: Option<f64>,
    #[serde(default)]
    pub valuation_tension: Option<f64>,
    #[serde(default)]
    pub catalyst_timing: Option<f64>,
    #[serde(default)]
    pub business_quality: Option<f64>,
    #[serde(default)]
    pub disclosure_friction: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub novelty: f64,
    pub edge_clarity: f64,
    pub valuation_tension: f64,
    pub catalyst_timing: f64,
    pub business_quality_prior: f64,
    pub repetition_penalty: f64,
    pub disclosure_friction_penalty: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub components: ScoreComponents,
    pub value: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdeaCard {
    pub id: Uuid,
    pub ticker: String,
    pub direction: Direction,
    pub thesis: String,
    pub confidence: ConfidenceTier,
    pub source: SourceDescriptor,
    #[serde(default)]
    pub corroborating_sources: Vec<String>,
    pub style: String,
    pub status: IdeaStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub signals: IdeaSignals,
    #[serde(default)]
    pub score: Option<Score>,
    pub first_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdeaCard {
    pub fn score_value(&self) -> f64 {
        self.score.as_ref().map(|s| s.value).unwrap_or(0.0)
    }

    pub fn transition(&mut self, status: IdeaStatus, reason: Option<String>, at: DateTime<Utc>) {
        self.status = status;
        self.status_reason = reason;
        self.updated_at = at;
    }
}

// ----------- Research artifacts -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    BusinessModel,
    IndustryMoat,
    FinancialForensics,
    CapitalAllocation,
    ManagementQuality,
    Valuation,
    RiskStress,
    Scenarios,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 8] = [
        ModuleKind::BusinessModel,
        ModuleKind::IndustryMoat,
        ModuleKind::FinancialForensics,
        ModuleKind::CapitalAllocation,
        ModuleKind::ManagementQuality,
        ModuleKind::Valuation,
        ModuleKind::RiskStress,
        ModuleKind::Scenarios,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::BusinessModel => "business_model",
            ModuleKind::IndustryMoat => "industry_moat",
            ModuleKind::FinancialForensics => "financial_forensics",
            ModuleKind::CapitalAllocation => "capital_allocation",
            ModuleKind::ManagementQuality => "management_quality",
            ModuleKind::Valuation => "valuation",
            ModuleKind::RiskStress => "risk_stress",
            ModuleKind::Scenarios => "scenarios",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only reference backing a claim made in a research module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: Uuid,
    pub packet_id: Uuid,
    pub module: ModuleKind,
    pub source_type: String,
    pub reliability: String,
    pub claim_type: String,
    pub locator: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Validated,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleAudit {
    pub agent: String,
    pub model: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub total_tokens: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResearchModule {
    pub kind: ModuleKind,
    pub status: ModuleStatus,
    /// Validated payload; `None` when the module is degraded.
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<FieldError>,
    pub audit: ModuleAudit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketStatus {
    Complete,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResearchPacket {
    pub id: Uuid,
    pub idea_id: Uuid,
    pub ticker: String,
    pub status: PacketStatus,
    pub modules: Vec<ResearchModule>,
    pub completed_at: DateTime<Utc>,
}

impl ResearchPacket {
    pub fn module(&self, kind: ModuleKind) -> Option<&ResearchModule> {
        self.modules.iter().find(|m| m.kind == kind)
    }
}

/// Written instead of a packet when research on an idea was aborted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PacketFailure {
    pub id: Uuid,
    pub idea_id: Uuid,
    pub ticker: String,
    pub module: Option<ModuleKind>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub packet_id: Uuid,
    pub idea_id: Uuid,
    pub ticker: String,
    pub status: PacketStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleExclusion {
    pub idea_id: Uuid,
    pub ticker: String,
    pub reason: String,
}

/// Weekly decision bundle. Never edited once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IcBundle {
    pub id: Uuid,
    pub week_label: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub packets: Vec<BundleEntry>,
    pub excluded: Vec<BundleExclusion>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoveltyRecord {
    pub ticker: String,
    pub last_seen: DateTime<Utc>,
    pub appearances: u32,
}
