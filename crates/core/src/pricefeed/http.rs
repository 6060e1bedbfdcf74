use crate::config::Settings;
use crate::pricefeed::{aggregate_buckets, PriceFeed, PriceHistory};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 3;
const HISTORY_PATH: &str = "/v1/history";

const FOUR_HOURS_MS: i64 = 4 * 3_600_000;

/// HTTP price feed client. The upstream exposes a single history endpoint;
/// latest price is derived from it (intraday series, falling back to daily
/// closes), and the unsupported 4h interval is aggregated from 1h data.
#[derive(Debug, Clone)]
pub struct HttpPriceFeed {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retries: u32,
}

impl HttpPriceFeed {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_price_feed_base_url()?.to_string();
        let api_key = settings.price_feed_api_key.clone();

        let timeout_secs = std::env::var("PRICE_FEED_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("PRICE_FEED_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build price feed http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            retries,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }

    async fn fetch_once(&self, ticker: &str, period: &str, interval: &str) -> Result<PriceHistory> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), HISTORY_PATH);
        let res = self
            .http
            .get(url)
            .headers(self.headers()?)
            .query(&[("ticker", ticker), ("period", period), ("interval", interval)])
            .send()
            .await
            .context("price feed request failed")?;

        let status = res.status();
        let text = res.text().await.context("failed to read feed response")?;
        if !status.is_success() {
            anyhow::bail!("price feed HTTP {status}: {text}");
        }

        let parsed = serde_json::from_str::<PriceHistory>(&text)
            .with_context(|| format!("failed to parse feed response: {text}"))?;
        anyhow::ensure!(
            parsed.timestamps.len() == parsed.closes.len(),
            "feed returned {} timestamps for {} closes",
            parsed.timestamps.len(),
            parsed.closes.len()
        );
        Ok(parsed)
    }

    async fn fetch(&self, ticker: &str, period: &str, interval: &str) -> Result<PriceHistory> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(ticker, period, interval).await {
                Ok(history) => return Ok(history),
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(ticker, attempt, ?backoff, error = %err, "price feed fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl PriceFeed for HttpPriceFeed {
    fn name(&self) -> &'static str {
        "external_http"
    }

    async fn latest_price(&self, ticker: &str) -> Result<Option<f64>> {
        match self.fetch(ticker, "1d", "1m").await {
            Ok(history) if history.last_close().is_some() => Ok(history.last_close()),
            Ok(_) => {
                // Quiet intraday session; fall back to the last daily close.
                Ok(self.fetch(ticker, "5d", "1d").await?.last_close())
            }
            Err(err) => {
                tracing::debug!(ticker, error = %err, "intraday fetch failed; trying daily closes");
                Ok(self.fetch(ticker, "5d", "1d").await?.last_close())
            }
        }
    }

    async fn history(&self, ticker: &str, period: &str, interval: &str) -> Result<PriceHistory> {
        // The upstream has no 4h interval; aggregate 1h closes instead.
        if interval == "4h" {
            let hourly = self.fetch(ticker, period, "1h").await?;
            return Ok(aggregate_buckets(&hourly, FOUR_HOURS_MS));
        }
        self.fetch(ticker, period, interval).await
    }
}
