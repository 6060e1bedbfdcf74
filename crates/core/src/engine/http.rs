use crate::config::Settings;
use crate::engine::error::EngineDiagnosticsError;
use crate::engine::{
    AnalysisEngine, EngineChunk, EngineConfig, EngineOutcome, EngineSession, EngineStream,
};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

// Engine runs debate multiple agents per ticker and can take minutes.
const DEFAULT_TIMEOUT_SECS: u64 = 900;
const STREAM_PATH: &str = "/v1/analyses/stream";

/// HTTP client for the external decision engine. The streaming endpoint
/// returns newline-delimited JSON: `{"type":"log","text":...}` progress lines
/// followed by a final `{"type":"result",...}` bundle.
#[derive(Debug, Clone)]
pub struct HttpAnalysisEngine {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAnalysisEngine {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_engine_base_url()?.to_string();
        let api_key = settings.engine_api_key.clone();

        let timeout_secs = std::env::var("ENGINE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build engine http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl AnalysisEngine for HttpAnalysisEngine {
    fn name(&self) -> &'static str {
        "external_http"
    }

    async fn configure(&self, config: &EngineConfig) -> Result<Box<dyn EngineSession>> {
        Ok(Box::new(HttpEngineSession {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            config: config.clone(),
        }))
    }
}

struct HttpEngineSession {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    config: EngineConfig,
}

impl HttpEngineSession {
    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl EngineSession for HttpEngineSession {
    async fn stream(&self, ticker: &str, as_of_date: NaiveDate) -> Result<EngineStream> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), STREAM_PATH);
        let body = RunRequest {
            ticker,
            as_of_date,
            debug: self.config.debug,
            selected_analysts: &self.config.selected_analysts,
            config: &self.config.overrides,
        };

        let res = self
            .http
            .post(url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .context("engine stream request failed")?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(EngineDiagnosticsError {
                stage: "stream",
                detail: format!("status={status}"),
                raw_body: Some(text),
            }
            .into());
        }

        let stream = res
            .bytes_stream()
            .map_err(|err| anyhow::Error::new(err).context("engine stream read failed"))
            .scan(String::new(), |buffer, chunk| {
                let events = match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        drain_lines(buffer)
                    }
                    Err(err) => vec![Err(err)],
                };
                futures_util::future::ready(Some(futures_util::stream::iter(events)))
            })
            .flatten();

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    ticker: &'a str,
    as_of_date: NaiveDate,
    debug: bool,
    selected_analysts: &'a [String],
    config: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Log {
        #[serde(default)]
        text: String,
    },
    Result {
        #[serde(default)]
        decision: Option<String>,
        #[serde(default)]
        signals: Value,
    },
}

fn drain_lines(buffer: &mut String) -> Vec<Result<EngineChunk>> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(parse_line(line));
    }
    out
}

fn parse_line(line: &str) -> Result<EngineChunk> {
    let parsed = serde_json::from_str::<StreamLine>(line)
        .with_context(|| format!("engine stream line is not valid JSON: {line}"))?;
    Ok(match parsed {
        StreamLine::Log { text } => EngineChunk::Log(text),
        StreamLine::Result { decision, signals } => {
            EngineChunk::Result(EngineOutcome { decision, signals })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_log_and_result_lines() {
        let chunk = parse_line(r#"{"type":"log","text":"examining fundamentals"}"#).unwrap();
        match chunk {
            EngineChunk::Log(text) => assert_eq!(text, "examining fundamentals"),
            other => panic!("expected log chunk, got {other:?}"),
        }

        let line = json!({
            "type": "result",
            "decision": "BUY",
            "signals": {"final_trade_decision": "BUY", "investment_plan": "hold 3 months"}
        })
        .to_string();
        match parse_line(&line).unwrap() {
            EngineChunk::Result(outcome) => {
                assert_eq!(outcome.decision.as_deref(), Some("BUY"));
                assert_eq!(outcome.signals["investment_plan"], json!("hold 3 months"));
            }
            other => panic!("expected result chunk, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line(r#"{"type":"unknown"}"#).is_err());
    }

    #[test]
    fn buffers_partial_lines_across_chunks() {
        let mut buffer = String::from(r#"{"type":"log","#);
        assert!(drain_lines(&mut buffer).is_empty());

        buffer.push_str("\"text\":\"a\"}\n{\"type\":\"log\",\"text\":\"b\"}\n");
        let events = drain_lines(&mut buffer);
        assert_eq!(events.len(), 2);
        assert!(buffer.is_empty());
    }
}
