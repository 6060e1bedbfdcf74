pub mod error;
pub mod http;
pub mod stub;

use anyhow::Result;
use chrono::NaiveDate;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};

/// Top-level post option keys forwarded to the engine as config overrides.
const TOP_LEVEL_OVERRIDES: [&str; 7] = [
    "llm_provider",
    "deep_think_llm",
    "quick_think_llm",
    "backend_url",
    "online_tools",
    "max_debate_rounds",
    "project_dir",
];

fn default_analysts() -> Vec<String> {
    ["market", "social", "news", "fundamentals"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Effective engine configuration for one run, built from a post's options
/// shallow-merged over engine defaults.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub debug: bool,
    pub selected_analysts: Vec<String>,
    pub overrides: Map<String, Value>,
}

impl EngineConfig {
    /// Merge order: defaults, then recognized top-level option keys, then the
    /// nested `config` map on top. Later keys win on collision.
    pub fn from_options(options: &Map<String, Value>, defaults: &Map<String, Value>) -> Self {
        let mut overrides = defaults.clone();
        for key in TOP_LEVEL_OVERRIDES {
            if let Some(value) = options.get(key) {
                overrides.insert(key.to_string(), value.clone());
            }
        }
        if let Some(Value::Object(nested)) = options.get("config") {
            for (key, value) in nested {
                overrides.insert(key.clone(), value.clone());
            }
        }

        let selected_analysts = match options.get("selected_analysts") {
            Some(Value::Array(items)) => {
                let list: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if list.is_empty() {
                    default_analysts()
                } else {
                    list
                }
            }
            _ => default_analysts(),
        };

        Self {
            debug: options.get("debug").and_then(Value::as_bool).unwrap_or(false),
            selected_analysts,
            overrides,
        }
    }
}

/// Final result bundle for one ticker: the engine's decision string (if it
/// exposes one) plus an opaque bag of rationale fields.
#[derive(Debug, Clone, Default)]
pub struct EngineOutcome {
    pub decision: Option<String>,
    pub signals: Value,
}

/// Incremental engine output: progress text, then the final outcome.
#[derive(Debug, Clone)]
pub enum EngineChunk {
    Log(String),
    Result(EngineOutcome),
}

pub type EngineStream = BoxStream<'static, Result<EngineChunk>>;

/// One configured engine session, driven once per ticker.
#[async_trait::async_trait]
pub trait EngineSession: Send + Sync {
    async fn stream(&self, ticker: &str, as_of_date: NaiveDate) -> Result<EngineStream>;
}

/// External multi-agent decision engine, consumed through a narrow interface.
/// Sessions are cheap local constructions and tolerate being rebuilt per
/// ticker; `configure` failing means the engine is unavailable or the options
/// are unusable, before any per-ticker work happens.
#[async_trait::async_trait]
pub trait AnalysisEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Engine-side default configuration the post's options merge over.
    fn defaults(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn configure(&self, config: &EngineConfig) -> Result<Box<dyn EngineSession>>;
}
