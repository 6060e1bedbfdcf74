use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Three-valued verdict produced by the analysis engine for one ticker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suggestion {
    Buy,
    Sell,
    #[default]
    Hold,
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Suggestion::Buy => "Buy",
            Suggestion::Sell => "Sell",
            Suggestion::Hold => "Hold",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerVerdict {
    pub suggestion: Suggestion,

    /// Opaque engine rationale (final decision text, investment plan,
    /// sub-judge decisions), passed through unchanged.
    #[serde(default)]
    pub signals: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Cumulative run log. Append-only for the lifetime of the post.
    #[serde(default)]
    pub report: String,

    #[serde(default)]
    pub per_ticker: BTreeMap<String, TickerVerdict>,

    /// One line per ticker, in the post's ticker order.
    #[serde(default)]
    pub summary: String,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Analysis {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            report: String::new(),
            per_ticker: BTreeMap::new(),
            summary: String::new(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub current: Option<f64>,
    pub pct: Option<f64>,
}

/// Purchase prices: either one price per ticker, or a single scalar applied
/// uniformly to every ticker (legacy form).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Purchases {
    Uniform(f64),
    PerTicker(BTreeMap<String, f64>),
}

impl Default for Purchases {
    fn default() -> Self {
        Purchases::PerTicker(BTreeMap::new())
    }
}

impl Purchases {
    pub fn price_for(&self, ticker: &str) -> Option<f64> {
        match self {
            Purchases::Uniform(price) => Some(*price),
            Purchases::PerTicker(map) => map.get(ticker).copied(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,

    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Uppercase symbols; order controls snapshot and summary ordering.
    #[serde(default)]
    pub tickers: Vec<String>,

    /// Opaque engine configuration, passed through to the analysis engine.
    #[serde(default)]
    pub options: Map<String, Value>,

    #[serde(default)]
    pub purchases: Purchases,

    #[serde(default)]
    pub analysis: Option<Analysis>,

    #[serde(default)]
    pub snapshot: BTreeMap<String, SnapshotEntry>,
}

impl Post {
    pub fn new(
        title: &str,
        description: &str,
        tickers: &[String],
        options: Map<String, Value>,
        purchases: Purchases,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            title: normalize_title(title),
            description: description.trim().to_string(),
            tickers: normalize_tickers(tickers),
            options,
            purchases,
            analysis: None,
            snapshot: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Analysis state, initialized in place on first use.
    pub fn analysis_mut(&mut self) -> &mut Analysis {
        self.analysis.get_or_insert_with(|| Analysis::empty(Utc::now()))
    }

    /// Recorded verdict for a ticker; absence reads as Hold.
    pub fn suggestion_for(&self, ticker: &str) -> Suggestion {
        self.analysis
            .as_ref()
            .and_then(|a| a.per_ticker.get(ticker))
            .map(|v| v.suggestion)
            .unwrap_or_default()
    }
}

pub fn normalize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn normalize_tickers(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_tickers_to_trimmed_uppercase() {
        let raw = vec![" aapl ".to_string(), "".to_string(), "Msft".to_string()];
        assert_eq!(normalize_tickers(&raw), vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn blank_title_defaults_to_untitled() {
        let post = Post::new("  ", "", &[], Map::new(), Purchases::default());
        assert_eq!(post.title, "Untitled");
        assert!(post.analysis.is_none());
        assert!(post.snapshot.is_empty());
    }

    #[test]
    fn purchases_accepts_scalar_and_map_forms() {
        let uniform: Purchases = serde_json::from_value(json!(123.5)).unwrap();
        assert_eq!(uniform.price_for("AAPL"), Some(123.5));
        assert_eq!(uniform.price_for("MSFT"), Some(123.5));

        let per: Purchases = serde_json::from_value(json!({"AAPL": 100.0})).unwrap();
        assert_eq!(per.price_for("AAPL"), Some(100.0));
        assert_eq!(per.price_for("MSFT"), None);
    }

    #[test]
    fn missing_verdict_reads_as_hold() {
        let mut post = Post::new("t", "", &["AAPL".to_string()], Map::new(), Purchases::default());
        assert_eq!(post.suggestion_for("AAPL"), Suggestion::Hold);

        post.analysis_mut().per_ticker.insert(
            "AAPL".to_string(),
            TickerVerdict {
                suggestion: Suggestion::Buy,
                signals: Value::Null,
            },
        );
        assert_eq!(post.suggestion_for("AAPL"), Suggestion::Buy);
    }

    #[test]
    fn post_round_trips_with_persisted_field_names() {
        let mut post = Post::new("basket", "desc", &["AAPL".to_string()], Map::new(), Purchases::default());
        post.analysis_mut().report = "AAPL: looks fine".to_string();

        let value = serde_json::to_value(&post).unwrap();
        assert!(value.get("createdAt").is_some());
        assert!(value.get("updatedAt").is_some());
        assert!(value["analysis"].get("per_ticker").is_some());

        let back: Post = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, post.id);
        assert_eq!(back.analysis.unwrap().report, "AAPL: looks fine");
    }
}
