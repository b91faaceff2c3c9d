pub mod client;
pub mod simulator;

use crate::core::error::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope returned by every aggregator accessor. `data` is `None` when the
/// provider has nothing for the ticker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataResult<T> {
    pub data: Option<T>,
    pub source: String,
    pub retrieved_at: DateTime<Utc>,
}

impl<T> DataResult<T> {
    pub fn found(data: T, source: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            data: Some(data),
            source: source.into(),
            retrieved_at: at,
        }
    }

    pub fn empty(source: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            data: None,
            source: source.into(),
            retrieved_at: at,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub ticker: String,
    pub name: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMetrics {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub pe_ratio: Option<f64>,
    #[serde(default)]
    pub ev_to_ebitda: Option<f64>,
    #[serde(default)]
    pub fcf_yield: Option<f64>,
    #[serde(default)]
    pub roic: Option<f64>,
    #[serde(default)]
    pub net_debt_to_ebitda: Option<f64>,
    #[serde(default)]
    pub revenue_growth: Option<f64>,
}

/// One fiscal period. Every line item is optional; providers are patchy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementPeriod {
    pub fiscal_year: i32,
    #[serde(default)]
    pub revenue: Option<f64>,
    #[serde(default)]
    pub gross_profit: Option<f64>,
    #[serde(default)]
    pub net_income: Option<f64>,
    #[serde(default)]
    pub operating_cash_flow: Option<f64>,
    #[serde(default)]
    pub total_assets: Option<f64>,
    #[serde(default)]
    pub current_assets: Option<f64>,
    #[serde(default)]
    pub current_liabilities: Option<f64>,
    #[serde(default)]
    pub long_term_debt: Option<f64>,
    #[serde(default)]
    pub shares_outstanding: Option<f64>,
}

/// Annual statements, most recent period first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatements {
    pub periods: Vec<StatementPeriod>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub headline: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filing {
    pub form: String,
    pub filed_at: DateTime<Utc>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub period: String,
    pub held_at: DateTime<Utc>,
    #[serde(default)]
    pub excerpt: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimates {
    #[serde(default)]
    pub eps_next_fy: Option<f64>,
    #[serde(default)]
    pub revenue_next_fy: Option<f64>,
    #[serde(default)]
    pub target_price: Option<f64>,
    #[serde(default)]
    pub analyst_count: Option<u32>,
}

#[async_trait]
pub trait DataAggregator: Send + Sync + 'static {
    async fn profile(&self, ticker: &str) -> Result<DataResult<CompanyProfile>, ProviderError>;
    async fn metrics(&self, ticker: &str) -> Result<DataResult<KeyMetrics>, ProviderError>;
    async fn statements(
        &self,
        ticker: &str,
    ) -> Result<DataResult<FinancialStatements>, ProviderError>;
    async fn news(&self, ticker: &str) -> Result<DataResult<Vec<NewsItem>>, ProviderError>;
    async fn filings(&self, ticker: &str) -> Result<DataResult<Vec<Filing>>, ProviderError>;
    async fn transcripts(&self, ticker: &str)
    -> Result<DataResult<Vec<Transcript>>, ProviderError>;
    async fn estimates(&self, ticker: &str) -> Result<DataResult<Estimates>, ProviderError>;
}

/// Everything the research agents see about one company.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyContext {
    pub profile: CompanyProfile,
    pub metrics: Option<KeyMetrics>,
    pub statements: Option<FinancialStatements>,
    pub news: Vec<NewsItem>,
    pub filings: Vec<Filing>,
    pub transcripts: Vec<Transcript>,
    pub estimates: Option<Estimates>,
}

/// Gathers a company context. A missing profile yields `Ok(None)`; secondary
/// datasets are best effort and only the profile call can fail the gather.
pub async fn gather(
    data: &dyn DataAggregator,
    ticker: &str,
) -> Result<Option<CompanyContext>, ProviderError> {
    let Some(profile) = data.profile(ticker).await?.data else {
        return Ok(None);
    };

    let (metrics, statements, news, filings, transcripts, estimates) = tokio::join!(
        data.metrics(ticker),
        data.statements(ticker),
        data.news(ticker),
        data.filings(ticker),
        data.transcripts(ticker),
        data.estimates(ticker),
    );

    fn ok<T>(r: Result<DataResult<T>, ProviderError>, what: &str, ticker: &str) -> Option<T> {
        match r {
            Ok(res) => res.data,
            Err(e) => {
                tracing::warn!(ticker, dataset = what, error = %e, "Dataset unavailable");
                None
            }
        }
    }

    Ok(Some(CompanyContext {
        profile,
        metrics: ok(metrics, "metrics", ticker),
        statements: ok(statements, "statements", ticker),
        news: ok(news, "news", ticker).unwrap_or_default(),
        filings: ok(filings, "filings", ticker).unwrap_or_default(),
        transcripts: ok(transcripts, "transcripts", ticker).unwrap_or_default(),
        estimates: ok(estimates, "estimates", ticker),
    }))
}
