use crate::config::config::DataCfg;
use crate::core::error::ProviderError;
use crate::data::{
    CompanyProfile, DataAggregator, DataResult, Estimates, Filing, FinancialStatements, KeyMetrics,
    NewsItem, Transcript,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

const PROVIDER: &str = "data";

/// JSON-over-HTTP aggregator. Endpoints live under `{base_url}/{dataset}/{ticker}`;
/// a 404 means "no data" rather than a failure.
#[derive(Clone)]
pub struct HttpDataAggregator {
    client: Client,
    cfg: DataCfg,
}

impl HttpDataAggregator {
    pub fn new(client: Client, cfg: DataCfg) -> Self {
        Self { client, cfg }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        dataset: &str,
        ticker: &str,
    ) -> Result<DataResult<T>, ProviderError> {
        let url = format!(
            "{}/{}/{}",
            self.cfg.base_url.trim_end_matches('/'),
            dataset,
            ticker
        );
        debug!(%url, "Fetching dataset");

        let mut req = self.client.get(&url).timeout(self.cfg.timeout);
        if !self.cfg.api_key.is_empty() {
            req = req.query(&[("apikey", self.cfg.api_key.as_str())]);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    provider: PROVIDER.into(),
                    after: self.cfg.timeout,
                }
            } else {
                ProviderError::request(PROVIDER, e)
            }
        })?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(DataResult::empty(url, Utc::now()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::request(
                PROVIDER,
                format!("{dataset} returned {status}: {body}"),
            ));
        }

        let data: Option<T> = resp
            .json()
            .await
            .map_err(|e| ProviderError::request(PROVIDER, e))?;
        Ok(DataResult {
            data,
            source: url,
            retrieved_at: Utc::now(),
        })
    }
}

#[async_trait]
impl DataAggregator for HttpDataAggregator {
    async fn profile(&self, ticker: &str) -> Result<DataResult<CompanyProfile>, ProviderError> {
        self.fetch("profile", ticker).await
    }

    async fn metrics(&self, ticker: &str) -> Result<DataResult<KeyMetrics>, ProviderError> {
        self.fetch("metrics", ticker).await
    }

    async fn statements(
        &self,
        ticker: &str,
    ) -> Result<DataResult<FinancialStatements>, ProviderError> {
        self.fetch("statements", ticker).await
    }

    async fn news(&self, ticker: &str) -> Result<DataResult<Vec<NewsItem>>, ProviderError> {
        self.fetch("news", ticker).await
    }

    async fn filings(&self, ticker: &str) -> Result<DataResult<Vec<Filing>>, ProviderError> {
        self.fetch("filings", ticker).await
    }

    async fn transcripts(
        &self,
        ticker: &str,
    ) -> Result<DataResult<Vec<Transcript>>, ProviderError> {
        self.fetch("transcripts", ticker).await
    }

    async fn estimates(&self, ticker: &str) -> Result<DataResult<Estimates>, ProviderError> {
        self.fetch("estimates", ticker).await
    }
}
