use crate::engine::{
    AnalysisEngine, EngineChunk, EngineConfig, EngineOutcome, EngineSession, EngineStream,
};
use anyhow::Result;
use chrono::NaiveDate;
use serde_json::json;

/// Null engine substituted at startup when no engine is configured.
/// Every ticker resolves to Hold with a stub note in its signals.
pub struct StubEngine;

#[async_trait::async_trait]
impl AnalysisEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn configure(&self, _config: &EngineConfig) -> Result<Box<dyn EngineSession>> {
        Ok(Box::new(StubSession))
    }
}

struct StubSession;

#[async_trait::async_trait]
impl EngineSession for StubSession {
    async fn stream(&self, _ticker: &str, _as_of_date: NaiveDate) -> Result<EngineStream> {
        let chunks = vec![
            Ok(EngineChunk::Log(
                "analysis engine not configured; using Hold placeholder".to_string(),
            )),
            Ok(EngineChunk::Result(EngineOutcome {
                decision: Some("Hold".to_string()),
                signals: json!({"note": "stub"}),
            })),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}
