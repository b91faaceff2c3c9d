use crate::core::error::ProviderError;
use crate::data::{
    CompanyContext, CompanyProfile, DataAggregator, DataResult, Estimates, Filing,
    FinancialStatements, KeyMetrics, NewsItem, Transcript,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

const SOURCE: &str = "simulated";

/// In-memory aggregator backed by per-ticker fixtures.
pub struct SimDataAggregator {
    companies: RwLock<HashMap<String, CompanyContext>>,
    failing: RwLock<HashSet<String>>,
    synthesize: bool,
}

impl SimDataAggregator {
    pub fn new() -> Self {
        Self {
            companies: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            synthesize: false,
        }
    }

    /// Unknown tickers get a synthetic profile instead of "no data".
    pub fn synthesizing() -> Self {
        Self {
            synthesize: true,
            ..Self::new()
        }
    }

    pub fn insert(&self, ctx: CompanyContext) {
        self.companies
            .write()
            .insert(ctx.profile.ticker.clone(), ctx);
    }

    pub fn with_profile(self, ticker: &str) -> Self {
        self.insert(Self::synthetic(ticker));
        self
    }

    /// Every accessor for `ticker` fails with a provider error.
    pub fn fail_ticker(&self, ticker: &str) {
        self.failing.write().insert(ticker.to_string());
    }

    fn synthetic(ticker: &str) -> CompanyContext {
        CompanyContext {
            profile: CompanyProfile {
                ticker: ticker.to_string(),
                name: format!("{ticker} Holdings"),
                sector: Some("Industrials".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn lookup(&self, ticker: &str) -> Result<Option<CompanyContext>, ProviderError> {
        if self.failing.read().contains(ticker) {
            return Err(ProviderError::request(SOURCE, format!("{ticker} unavailable")));
        }
        let found = self.companies.read().get(ticker).cloned();
        Ok(found.or_else(|| self.synthesize.then(|| Self::synthetic(ticker))))
    }

    fn project<T>(
        &self,
        ticker: &str,
        f: impl FnOnce(CompanyContext) -> Option<T>,
    ) -> Result<DataResult<T>, ProviderError> {
        let now = Utc::now();
        Ok(match self.lookup(ticker)?.and_then(f) {
            Some(data) => DataResult::found(data, SOURCE, now),
            None => DataResult::empty(SOURCE, now),
        })
    }
}

impl Default for SimDataAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataAggregator for SimDataAggregator {
    async fn profile(&self, ticker: &str) -> Result<DataResult<CompanyProfile>, ProviderError> {
        self.project(ticker, |c| Some(c.profile))
    }

    async fn metrics(&self, ticker: &str) -> Result<DataResult<KeyMetrics>, ProviderError> {
        self.project(ticker, |c| c.metrics)
    }

    async fn statements(
        &self,
        ticker: &str,
    ) -> Result<DataResult<FinancialStatements>, ProviderError> {
        self.project(ticker, |c| c.statements)
    }

    async fn news(&self, ticker: &str) -> Result<DataResult<Vec<NewsItem>>, ProviderError> {
        self.project(ticker, |c| Some(c.news))
    }

    async fn filings(&self, ticker: &str) -> Result<DataResult<Vec<Filing>>, ProviderError> {
        self.project(ticker, |c| Some(c.filings))
    }

    async fn transcripts(
        &self,
        ticker: &str,
    ) -> Result<DataResult<Vec<Transcript>>, ProviderError> {
        self.project(ticker, |c| Some(c.transcripts))
    }

    async fn estimates(&self, ticker: &str) -> Result<DataResult<Estimates>, ProviderError> {
        self.project(ticker, |c| c.estimates)
    }
}
