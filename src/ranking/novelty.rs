use crate::core::types::NoveltyRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

const SECS_PER_DAY: f64 = 86_400.0;

/// Last-seen bookkeeping per ticker. Shared between Lane A runs; persisted via
/// the store and hydrated on startup.
pub struct NoveltyStore {
    records: Mutex<HashMap<String, NoveltyRecord>>,
    full_novelty_days: f64,
    penalty_window_days: f64,
}

/// Novelty in [0,1]: 1.0 when never seen or unseen for `full_days`, linear below.
pub fn novelty_from_days(days_since: Option<f64>, full_days: f64) -> f64 {
    match days_since {
        None => 1.0,
        Some(d) if d >= full_days => 1.0,
        Some(d) => (d.max(0.0) / full_days).clamp(0.0, 1.0),
    }
}

/// Repetition penalty in [0,1]: linear in recency within the window, zero outside.
pub fn repetition_from_days(days_since: Option<f64>, window_days: f64) -> f64 {
    match days_since {
        Some(d) if d < window_days => ((window_days - d.max(0.0)) / window_days).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

impl NoveltyStore {
    pub fn new(full_novelty_days: i64, penalty_window_days: i64) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            full_novelty_days: full_novelty_days as f64,
            penalty_window_days: penalty_window_days as f64,
        }
    }

    pub fn hydrate(&self, records: impl IntoIterator<Item = NoveltyRecord>) {
        let mut map = self.records.lock();
        for r in records {
            map.insert(r.ticker.clone(), r);
        }
    }

    pub fn get(&self, ticker: &str) -> Option<NoveltyRecord> {
        self.records.lock().get(ticker).cloned()
    }

    fn days_since(&self, ticker: &str, as_of: DateTime<Utc>) -> Option<f64> {
        self.records
            .lock()
            .get(ticker)
            .map(|r| (as_of - r.last_seen).num_seconds() as f64 / SECS_PER_DAY)
    }

    pub fn novelty(&self, ticker: &str, as_of: DateTime<Utc>) -> f64 {
        novelty_from_days(self.days_since(ticker, as_of), self.full_novelty_days)
    }

    pub fn repetition_penalty(&self, ticker: &str, as_of: DateTime<Utc>) -> f64 {
        repetition_from_days(self.days_since(ticker, as_of), self.penalty_window_days)
    }

    /// Marks `ticker` as seen at `ts`. The appearance count grows while
    /// sightings stay inside the penalty window and restarts at 1 otherwise.
    pub fn record_observation(&self, ticker: &str, ts: DateTime<Utc>) -> NoveltyRecord {
        let mut map = self.records.lock();
        let appearances = match map.get(ticker) {
            Some(prev) => {
                let days = (ts - prev.last_seen).num_seconds() as f64 / SECS_PER_DAY;
                if days < self.penalty_window_days {
                    prev.appearances.saturating_add(1)
                } else {
                    1
                }
            }
            None => 1,
        };
        let record = NoveltyRecord {
            ticker: ticker.to_string(),
            last_seen: ts,
            appearances,
        };
        map.insert(ticker.to_string(), record.clone());
        record
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
