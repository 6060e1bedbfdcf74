use crate::pricefeed::{PriceFeed, PriceHistory};
use anyhow::Result;

/// Null feed substituted at startup when no price source is configured.
/// Prices read as absent and histories as empty.
pub struct StubPriceFeed;

#[async_trait::async_trait]
impl PriceFeed for StubPriceFeed {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn latest_price(&self, _ticker: &str) -> Result<Option<f64>> {
        Ok(None)
    }

    async fn history(&self, _ticker: &str, _period: &str, _interval: &str) -> Result<PriceHistory> {
        Ok(PriceHistory::default())
    }
}
