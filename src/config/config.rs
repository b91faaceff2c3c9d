use crate::core::types::{ConfidenceTier, SourceKind};
use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub logging: LoggingCfg,
    #[serde(default)]
    pub llm: LlmCfg,
    #[serde(default)]
    pub data: DataCfg,
    #[serde(default)]
    pub database: DatabaseCfg,
    #[serde(default)]
    pub sources: Vec<SourceCfg>,
    #[serde(rename = "lane0", default)]
    pub lane0: Lane0Cfg,
    #[serde(rename = "laneA", default)]
    pub lane_a: LaneACfg,
    #[serde(rename = "laneB", default)]
    pub lane_b: LaneBCfg,
    #[serde(default)]
    pub ranking: RankingCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpCfg {
    #[serde(rename = "userAgent", default = "default_ua")]
    pub user_agent: String,
    #[serde(rename = "tcpKeepAlive", with = "humantime_serde", default = "default_keep_alive")]
    pub tcp_keep_alive: Duration,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(rename = "poolIdleTimeout", with = "humantime_serde", default = "default_pool_idle")]
    pub pool_idle_timeout: Duration,
    #[serde(rename = "poolMaxIdlePerHost", default = "default_pool")]
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            user_agent: default_ua(),
            tcp_keep_alive: default_keep_alive(),
            timeout: default_timeout(),
            pool_idle_timeout: default_pool_idle(),
            pool_max_idle_per_host: default_pool(),
        }
    }
}
fn default_ua() -> String {
    "ideaflow/0.1".into()
}
fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_pool_idle() -> Duration {
    Duration::from_secs(90)
}
fn default_pool() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingCfg {
    #[serde(default)]
    pub json: bool,
}

/// Per-agent override of the model and sampling parameters.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ModelRoute {
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(rename = "maxTokens", default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmCfg {
    #[serde(rename = "baseUrl", default = "default_llm_base")]
    pub base_url: String,
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(rename = "maxTokens", default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(rename = "rateLimitRpm", default = "default_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(rename = "callTimeout", with = "humantime_serde", default = "default_call_timeout")]
    pub call_timeout: Duration,
    #[serde(rename = "maxAttempts", default = "default_attempts")]
    pub max_attempts: u32,
    /// Keyed by agent name, e.g. `valuation`.
    #[serde(default)]
    pub routes: HashMap<String, ModelRoute>,
}

impl Default for LlmCfg {
    fn default() -> Self {
        Self {
            base_url: default_llm_base(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            rate_limit_rpm: default_rpm(),
            call_timeout: default_call_timeout(),
            max_attempts: default_attempts(),
            routes: HashMap::new(),
        }
    }
}
fn default_llm_base() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_rpm() -> u32 {
    60
}
fn default_call_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_attempts() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataCfg {
    #[serde(rename = "baseUrl", default)]
    pub base_url: String,
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

impl Default for DataCfg {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout: default_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseCfg {
    /// Postgres connection string. Empty means the in-memory store.
    #[serde(default)]
    pub url: String,
    #[serde(rename = "maxConnections", default = "default_db_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseCfg {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_db_connections(),
        }
    }
}
fn default_db_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceCfg {
    pub name: String,
    pub url: String,
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
}
fn default_source_kind() -> SourceKind {
    SourceKind::Screener
}

#[derive(Debug, Deserialize, Clone)]
pub struct Lane0Cfg {
    #[serde(rename = "minConfidence", default = "default_min_confidence")]
    pub min_confidence: ConfidenceTier,
    #[serde(rename = "maxIdeasToLaneA", default = "default_max_to_lane_a")]
    pub max_ideas_to_lane_a: usize,
    #[serde(rename = "sourceTimeout", with = "humantime_serde", default = "default_source_timeout")]
    pub source_timeout: Duration,
}

impl Default for Lane0Cfg {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_ideas_to_lane_a: default_max_to_lane_a(),
            source_timeout: default_source_timeout(),
        }
    }
}
fn default_min_confidence() -> ConfidenceTier {
    ConfidenceTier::Medium
}
fn default_max_to_lane_a() -> usize {
    200
}
fn default_source_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Deserialize, Clone)]
pub struct LaneACfg {
    #[serde(default = "default_lane_a_target")]
    pub target: usize,
    #[serde(default = "default_lane_a_cap")]
    pub cap: usize,
    #[serde(default)]
    pub enrich: bool,
    #[serde(rename = "enrichConcurrency", default = "default_enrich_concurrency")]
    pub enrich_concurrency: usize,
    /// Derive the business-quality prior from reported statements.
    #[serde(rename = "fundamentalsPrior", default)]
    pub fundamentals_prior: bool,
}

impl Default for LaneACfg {
    fn default() -> Self {
        Self {
            target: default_lane_a_target(),
            cap: default_lane_a_cap(),
            enrich: false,
            enrich_concurrency: default_enrich_concurrency(),
            fundamentals_prior: false,
        }
    }
}
fn default_lane_a_target() -> usize {
    120
}
fn default_lane_a_cap() -> usize {
    200
}
fn default_enrich_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct LaneBCfg {
    #[serde(rename = "dailyTarget", default = "default_daily_target")]
    pub daily_target: u32,
    #[serde(rename = "dailyMax", default = "default_daily_max")]
    pub daily_max: u32,
    #[serde(rename = "weeklyMax", default = "default_weekly_max")]
    pub weekly_max: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for LaneBCfg {
    fn default() -> Self {
        Self {
            daily_target: default_daily_target(),
            daily_max: default_daily_max(),
            weekly_max: default_weekly_max(),
            concurrency: default_concurrency(),
        }
    }
}
fn default_daily_target() -> u32 {
    3
}
fn default_daily_max() -> u32 {
    4
}
fn default_weekly_max() -> u32 {
    10
}
fn default_concurrency() -> usize {
    3
}

/// Additive ranking weights. Penalty weights are given as magnitudes.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WeightsCfg {
    pub novelty: f64,
    #[serde(rename = "edgeClarity")]
    pub edge_clarity: f64,
    #[serde(rename = "valuationTension")]
    pub valuation_tension: f64,
    #[serde(rename = "catalystTiming")]
    pub catalyst_timing: f64,
    #[serde(rename = "businessQuality")]
    pub business_quality: f64,
    pub repetition: f64,
    #[serde(rename = "disclosureFriction")]
    pub disclosure_friction: f64,
}

impl Default for WeightsCfg {
    fn default() -> Self {
        // remainder after novelty split evenly across the four positive signals
        Self {
            novelty: 0.45,
            edge_clarity: 0.1125,
            valuation_tension: 0.1125,
            catalyst_timing: 0.1125,
            business_quality: 0.1125,
            repetition: 0.05,
            disclosure_friction: 0.05,
        }
    }
}

impl WeightsCfg {
    pub fn positive_sum(&self) -> f64 {
        self.novelty
            + self.edge_clarity
            + self.valuation_tension
            + self.catalyst_timing
            + self.business_quality
    }

    pub fn penalty_sum(&self) -> f64 {
        self.repetition.abs() + self.disclosure_friction.abs()
    }

    pub fn validate(&self) -> Result<()> {
        let positives = [
            self.novelty,
            self.edge_clarity,
            self.valuation_tension,
            self.catalyst_timing,
            self.business_quality,
        ];
        anyhow::ensure!(
            positives.iter().all(|w| w.is_finite() && *w >= 0.0),
            "ranking.weights: positive weights must be finite and >= 0"
        );
        anyhow::ensure!(
            (self.positive_sum() - 0.90).abs() <= 0.01,
            "ranking.weights: positive weights sum to {:.4}, expected 0.90 ± 0.01",
            self.positive_sum()
        );
        anyhow::ensure!(
            (self.penalty_sum() - 0.10).abs() <= 0.01,
            "ranking.weights: penalty weights sum to {:.4}, expected 0.10 ± 0.01",
            self.penalty_sum()
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankingCfg {
    #[serde(default)]
    pub weights: WeightsCfg,
    #[serde(rename = "fullNoveltyDays", default = "default_full_novelty_days")]
    pub full_novelty_days: i64,
    #[serde(rename = "penaltyWindowDays", default = "default_penalty_window_days")]
    pub penalty_window_days: i64,
}

impl Default for RankingCfg {
    fn default() -> Self {
        Self {
            weights: WeightsCfg::default(),
            full_novelty_days: default_full_novelty_days(),
            penalty_window_days: default_penalty_window_days(),
        }
    }
}
fn default_full_novelty_days() -> i64 {
    90
}
fn default_penalty_window_days() -> i64 {
    30
}

impl AppCfg {
    pub fn load(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("building config")?;

        let app: AppCfg = cfg.try_deserialize().context("deserializing config")?;
        app.validate()?;
        Ok(app)
    }

    /// Setup-time invariants. A config that fails here never reaches a lane.
    pub fn validate(&self) -> Result<()> {
        self.ranking.weights.validate()?;
        anyhow::ensure!(
            self.ranking.penalty_window_days > 0
                && self.ranking.penalty_window_days <= self.ranking.full_novelty_days,
            "ranking: penaltyWindowDays must be in (0, fullNoveltyDays]"
        );
        anyhow::ensure!(
            self.lane0.max_ideas_to_lane_a > 0,
            "lane0.maxIdeasToLaneA must be > 0"
        );
        anyhow::ensure!(
            self.lane_a.target < self.lane_a.cap,
            "laneA.target ({}) must be < laneA.cap ({})",
            self.lane_a.target,
            self.lane_a.cap
        );
        anyhow::ensure!(
            self.lane_a.enrich_concurrency > 0,
            "laneA.enrichConcurrency must be > 0"
        );
        anyhow::ensure!(
            self.lane_b.daily_target < self.lane_b.daily_max,
            "laneB.dailyTarget ({}) must be < laneB.dailyMax ({})",
            self.lane_b.daily_target,
            self.lane_b.daily_max
        );
        anyhow::ensure!(
            self.lane_b.daily_max <= self.lane_b.weekly_max,
            "laneB.dailyMax must be <= laneB.weeklyMax"
        );
        anyhow::ensure!(self.lane_b.concurrency > 0, "laneB.concurrency must be > 0");
        anyhow::ensure!(self.llm.max_attempts >= 1, "llm.maxAttempts must be >= 1");
        for source in &self.sources {
            anyhow::ensure!(!source.name.is_empty(), "sources[].name missing");
            anyhow::ensure!(!source.url.is_empty(), "sources.{}.url missing", source.name);
        }
        Ok(())
    }

    /// Extra checks that only apply when talking to real collaborators.
    pub fn validate_live(&self) -> Result<()> {
        anyhow::ensure!(!self.sources.is_empty(), "sources must not be empty");
        anyhow::ensure!(!self.llm.api_key.is_empty(), "llm.apiKey missing");
        anyhow::ensure!(!self.data.base_url.is_empty(), "data.baseUrl missing");
        Ok(())
    }
}
