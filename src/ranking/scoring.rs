use crate::config::config::WeightsCfg;
use crate::core::types::{IdeaCard, Score, ScoreComponents};
use crate::ranking::novelty::NoveltyStore;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

pub const DEFAULT_VALUATION_TENSION: f64 = 0.5;
pub const DEFAULT_CATALYST_TIMING: f64 = 0.5;
pub const DEFAULT_BUSINESS_QUALITY: f64 = 0.5;
pub const DEFAULT_DISCLOSURE_FRICTION: f64 = 0.0;

#[derive(Clone, Debug)]
pub struct Scorer {
    weights: WeightsCfg,
}

impl Scorer {
    pub fn new(weights: WeightsCfg) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &WeightsCfg {
        &self.weights
    }

    /// Resolves every component for `idea`, falling back to priors where
    /// neither the source nor enrichment supplied a signal.
    pub fn components(
        &self,
        idea: &IdeaCard,
        novelty: &NoveltyStore,
        as_of: DateTime<Utc>,
    ) -> ScoreComponents {
        let s = &idea.signals;
        ScoreComponents {
            novelty: novelty.novelty(&idea.ticker, as_of),
            edge_clarity: unit(s.edge_clarity.unwrap_or(idea.confidence.edge_prior())),
            valuation_tension: unit(s.valuation_tension.unwrap_or(DEFAULT_VALUATION_TENSION)),
            catalyst_timing: unit(s.catalyst_timing.unwrap_or(DEFAULT_CATALYST_TIMING)),
            business_quality_prior: unit(s.business_quality.unwrap_or(DEFAULT_BUSINESS_QUALITY)),
            repetition_penalty: unit(novelty.repetition_penalty(&idea.ticker, as_of)),
            disclosure_friction_penalty: unit(
                s.disclosure_friction.unwrap_or(DEFAULT_DISCLOSURE_FRICTION),
            ),
        }
    }

    pub fn combine(&self, c: &ScoreComponents) -> f64 {
        let w = &self.weights;
        let raw = w.novelty * unit(c.novelty)
            + w.edge_clarity * unit(c.edge_clarity)
            + w.valuation_tension * unit(c.valuation_tension)
            + w.catalyst_timing * unit(c.catalyst_timing)
            + w.business_quality * unit(c.business_quality_prior)
            - w.repetition.abs() * unit(c.repetition_penalty)
            - w.disclosure_friction.abs() * unit(c.disclosure_friction_penalty);
        unit(raw)
    }

    pub fn score(&self, idea: &IdeaCard, novelty: &NoveltyStore, as_of: DateTime<Utc>) -> Score {
        let components = self.components(idea, novelty, as_of);
        Score {
            value: self.combine(&components),
            components,
            computed_at: as_of,
        }
    }
}

fn unit(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

/// Score desc, then earlier first-seen, then ticker.
pub fn rank_order(a: &IdeaCard, b: &IdeaCard) -> Ordering {
    b.score_value()
        .partial_cmp(&a.score_value())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.first_seen_at.cmp(&b.first_seen_at))
        .then_with(|| a.ticker.cmp(&b.ticker))
}

pub fn rank(ideas: &mut [IdeaCard]) {
    ideas.sort_by(rank_order);
}
