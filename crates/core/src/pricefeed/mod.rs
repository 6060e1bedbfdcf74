pub mod http;
pub mod stub;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Ordered close series for one ticker. Timestamps are epoch milliseconds
/// aligned to the start of each interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
    pub timestamps: Vec<i64>,
    pub closes: Vec<f64>,
}

impl PriceHistory {
    pub fn last_close(&self) -> Option<f64> {
        self.closes.last().copied()
    }
}

/// External price source, consumed through a narrow interface.
#[async_trait::async_trait]
pub trait PriceFeed: Send + Sync {
    fn name(&self) -> &'static str;

    async fn latest_price(&self, ticker: &str) -> Result<Option<f64>>;

    async fn history(&self, ticker: &str, period: &str, interval: &str) -> Result<PriceHistory>;
}

/// Bucket-average a close series into coarser intervals, aligned to bucket
/// start. Used when the upstream feed does not support the requested interval.
pub fn aggregate_buckets(history: &PriceHistory, bucket_ms: i64) -> PriceHistory {
    let mut out = PriceHistory::default();
    let mut bucket: Option<i64> = None;
    let mut sum = 0.0;
    let mut count = 0usize;

    for (&ts, &close) in history.timestamps.iter().zip(&history.closes) {
        let start = ts - ts.rem_euclid(bucket_ms);
        if bucket != Some(start) {
            push_bucket(&mut out, bucket, sum, count);
            bucket = Some(start);
            sum = 0.0;
            count = 0;
        }
        sum += close;
        count += 1;
    }
    push_bucket(&mut out, bucket, sum, count);
    out
}

fn push_bucket(out: &mut PriceHistory, bucket: Option<i64>, sum: f64, count: usize) {
    if let Some(start) = bucket {
        if count > 0 {
            out.timestamps.push(start);
            out.closes.push(sum / count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    #[test]
    fn aggregates_hourly_closes_into_four_hour_buckets() {
        // Hours 0..6 of some day: buckets [0..4) and [4..8).
        let history = PriceHistory {
            timestamps: (0..6).map(|h| h * HOUR_MS).collect(),
            closes: vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0],
        };

        let agg = aggregate_buckets(&history, 4 * HOUR_MS);
        assert_eq!(agg.timestamps, vec![0, 4 * HOUR_MS]);
        assert_eq!(agg.closes, vec![2.5, 15.0]);
    }

    #[test]
    fn aligns_buckets_to_bucket_start() {
        // A single sample mid-bucket lands on the bucket's start timestamp.
        let history = PriceHistory {
            timestamps: vec![5 * HOUR_MS],
            closes: vec![7.0],
        };
        let agg = aggregate_buckets(&history, 4 * HOUR_MS);
        assert_eq!(agg.timestamps, vec![4 * HOUR_MS]);
        assert_eq!(agg.closes, vec![7.0]);
    }

    #[test]
    fn empty_series_aggregates_to_empty() {
        let agg = aggregate_buckets(&PriceHistory::default(), 4 * HOUR_MS);
        assert!(agg.timestamps.is_empty());
        assert!(agg.closes.is_empty());
    }
}
