use crate::domain::post::{Post, SnapshotEntry};
use crate::pricefeed::PriceFeed;
use crate::storage::PostStore;

/// Percent change from purchase to current price. Absent when either price is
/// missing or the purchase price is zero.
pub fn percent_change(purchase: Option<f64>, current: Option<f64>) -> Option<f64> {
    let purchase = purchase?;
    let current = current?;
    if purchase == 0.0 {
        return None;
    }
    Some((current - purchase) / purchase * 100.0)
}

/// Current price and percent-change for one ticker. Price feed failure
/// degrades to absent fields rather than an error.
pub async fn snapshot_ticker(
    feed: &dyn PriceFeed,
    ticker: &str,
    purchase: Option<f64>,
) -> SnapshotEntry {
    let current = match feed.latest_price(ticker).await {
        Ok(price) => price,
        Err(err) => {
            tracing::debug!(ticker, error = %err, "latest price fetch failed");
            None
        }
    };
    SnapshotEntry {
        current,
        pct: percent_change(purchase, current),
    }
}

/// Refresh the whole snapshot map of a post without running analysis.
/// Returns the updated post, or None when the id is unknown.
pub async fn refresh_snapshot(
    store: &PostStore,
    feed: &dyn PriceFeed,
    post_id: &str,
) -> anyhow::Result<Option<Post>> {
    let Some(post) = store.find(post_id).await else {
        return Ok(None);
    };

    // Feed calls happen before the store lock is taken.
    let mut entries = std::collections::BTreeMap::new();
    for ticker in &post.tickers {
        let purchase = post.purchases.price_for(ticker);
        entries.insert(ticker.clone(), snapshot_ticker(feed, ticker, purchase).await);
    }

    let updated = store
        .transaction(post_id, move |post| {
            post.snapshot = entries;
            post.touch();
        })
        .await?;
    if !updated {
        return Ok(None);
    }
    Ok(store.find(post_id).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_change_requires_both_prices_and_nonzero_purchase() {
        assert_eq!(percent_change(None, Some(150.0)), None);
        assert_eq!(percent_change(Some(100.0), None), None);
        assert_eq!(percent_change(Some(0.0), Some(150.0)), None);
        assert_eq!(percent_change(None, None), None);
    }

    #[test]
    fn percent_change_is_exact() {
        assert_eq!(percent_change(Some(100.0), Some(150.0)), Some(50.0));
        assert_eq!(percent_change(Some(200.0), Some(150.0)), Some(-25.0));
        assert_eq!(percent_change(Some(100.0), Some(100.0)), Some(0.0));
    }
}
