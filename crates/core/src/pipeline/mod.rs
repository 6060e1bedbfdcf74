use crate::decision;
use crate::domain::post::{Post, SnapshotEntry, Suggestion, TickerVerdict};
use crate::engine::{AnalysisEngine, EngineChunk, EngineConfig, EngineOutcome};
use crate::pricefeed::PriceFeed;
use crate::schedule;
use crate::snapshot;
use crate::storage::PostStore;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Report lines wrap at this column.
pub const REPORT_WRAP_COLUMNS: usize = 120;

/// Progress events for one analysis run, in emission order. Serialized with a
/// kebab-case `type` tag for the push transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunEvent {
    Start {
        id: String,
        tickers: Vec<String>,
    },
    TickerStart {
        ticker: String,
    },
    Log {
        ticker: String,
        message: String,
    },
    TickerDone {
        ticker: String,
        suggestion: Suggestion,
        current: Option<f64>,
        pct: Option<f64>,
    },
    TickerError {
        ticker: String,
        error: String,
    },
    Error {
        message: String,
    },
    Done {
        id: String,
    },
}

/// One entry of a fleet run: the updated post, or the error that stopped it.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FleetEntry {
    Updated(Post),
    Failed { id: String, error: String },
}

struct Emitter {
    tx: Option<mpsc::Sender<RunEvent>>,
}

impl Emitter {
    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            // A gone client is not an error; the run keeps updating the store.
            let _ = tx.send(event).await;
        }
    }
}

/// Per-post, per-ticker analysis driver. The streaming and batch entry points
/// share one code path, so both produce the same persisted end state; the
/// streaming variant additionally pushes `RunEvent`s into a channel.
///
/// Engine and price-feed calls always happen outside the store lock; every
/// state change is its own short transaction.
pub struct AnalysisPipeline {
    store: Arc<PostStore>,
    engine: Arc<dyn AnalysisEngine>,
    feed: Arc<dyn PriceFeed>,
}

impl AnalysisPipeline {
    pub fn new(
        store: Arc<PostStore>,
        engine: Arc<dyn AnalysisEngine>,
        feed: Arc<dyn PriceFeed>,
    ) -> Self {
        Self {
            store,
            engine,
            feed,
        }
    }

    /// Batch run over one post. Returns the updated post, or None when the id
    /// is unknown.
    pub async fn run(&self, post_id: &str) -> Result<Option<Post>> {
        self.run_with_date(post_id, None).await
    }

    pub async fn run_with_date(
        &self,
        post_id: &str,
        as_of_date: Option<NaiveDate>,
    ) -> Result<Option<Post>> {
        let emitter = Emitter { tx: None };
        if !self.run_inner(post_id, as_of_date, &emitter).await? {
            return Ok(None);
        }
        Ok(self.store.find(post_id).await)
    }

    /// Streaming run: identical store effects, plus progress events. Returns
    /// Ok(false) when the post does not exist.
    pub async fn run_streaming(&self, post_id: &str, tx: mpsc::Sender<RunEvent>) -> Result<bool> {
        let emitter = Emitter { tx: Some(tx) };
        self.run_inner(post_id, None, &emitter).await
    }

    /// Sequential batch run over every post. Per-post failures are captured in
    /// the result rather than aborting the fleet.
    pub async fn run_all(&self) -> Vec<FleetEntry> {
        self.run_all_with_date(None).await
    }

    pub async fn run_all_with_date(&self, as_of_date: Option<NaiveDate>) -> Vec<FleetEntry> {
        let posts = self.store.list().await;
        let mut out = Vec::with_capacity(posts.len());
        for post in posts {
            let id = post.id;
            match self.run_with_date(&id, as_of_date).await {
                Ok(Some(updated)) => out.push(FleetEntry::Updated(updated)),
                Ok(None) => out.push(FleetEntry::Failed {
                    id,
                    error: "post not found".to_string(),
                }),
                Err(err) => {
                    let error = format!("{err:#}");
                    tracing::error!(post_id = %id, error = %error, "fleet analysis run failed");
                    out.push(FleetEntry::Failed { id, error });
                }
            }
        }
        out
    }

    /// Recompute and persist the summary from the current analysis state,
    /// without running the engine. Per ticker: recorded verdict, else a strict
    /// scan of report lines mentioning it, else Hold.
    pub async fn summarize(&self, post_id: &str) -> Result<Option<Post>> {
        let Some(post) = self.store.find(post_id).await else {
            return Ok(None);
        };
        if post.tickers.is_empty() {
            return Ok(Some(post));
        }

        let arg = post.options.get("date").and_then(|v| v.as_str());
        let date_label = schedule::resolve_as_of_date(arg, Utc::now())?.to_string();

        let (report, per) = post
            .analysis
            .as_ref()
            .map(|a| (a.report.clone(), a.per_ticker.clone()))
            .unwrap_or_default();

        let lines: Vec<String> = post
            .tickers
            .iter()
            .map(|ticker| {
                let suggestion = per
                    .get(ticker)
                    .map(|v| v.suggestion)
                    .or_else(|| decision::scan_decision_for_ticker(&report, ticker))
                    .unwrap_or_default();
                format!("{ticker}: {suggestion} ({date_label})")
            })
            .collect();
        let summary = lines.join("\n");

        self.store
            .transaction(post_id, move |post| {
                let analysis = post.analysis_mut();
                analysis.summary = summary;
                analysis.updated_at = Utc::now();
                post.touch();
            })
            .await?;
        Ok(self.store.find(post_id).await)
    }

    async fn run_inner(
        &self,
        post_id: &str,
        date_override: Option<NaiveDate>,
        events: &Emitter,
    ) -> Result<bool> {
        let Some(post) = self.store.find(post_id).await else {
            return Ok(false);
        };
        let tickers = post.tickers.clone();

        // Make the analysis log structure exist before any events flow.
        self.store
            .transaction(post_id, |post| {
                post.analysis_mut().updated_at = Utc::now();
                post.touch();
            })
            .await?;
        events
            .emit(RunEvent::Start {
                id: post_id.to_string(),
                tickers: tickers.clone(),
            })
            .await;

        let config = EngineConfig::from_options(&post.options, &self.engine.defaults());
        let as_of_date = match date_override {
            Some(date) => date,
            None => {
                let arg = post.options.get("date").and_then(|v| v.as_str());
                match schedule::resolve_as_of_date(arg, Utc::now()) {
                    Ok(date) => date,
                    Err(err) => {
                        self.abort_run(post_id, events, format!("{err:#}")).await?;
                        return Ok(true);
                    }
                }
            }
        };

        // Pre-flight: an unusable engine pre-empts the whole run before any
        // per-ticker state is touched.
        if let Err(err) = self.engine.configure(&config).await {
            self.abort_run(
                post_id,
                events,
                format!("analysis engine unavailable: {err:#}"),
            )
            .await?;
            return Ok(true);
        }

        for ticker in &tickers {
            events
                .emit(RunEvent::TickerStart {
                    ticker: ticker.clone(),
                })
                .await;

            match self
                .drive_ticker(post_id, ticker, as_of_date, &config, events)
                .await
            {
                Ok((outcome, last_seen)) => {
                    let explicit = outcome
                        .decision
                        .as_deref()
                        .map(str::trim)
                        .filter(|s| !s.is_empty());
                    let suggestion = match explicit {
                        Some(text) => decision::normalize(text),
                        None => last_seen.unwrap_or_default(),
                    };

                    let verdict = TickerVerdict {
                        suggestion,
                        signals: outcome.signals,
                    };
                    let ticker_owned = ticker.clone();
                    self.store
                        .transaction(post_id, move |post| {
                            let analysis = post.analysis_mut();
                            analysis.per_ticker.insert(ticker_owned, verdict);
                            analysis.updated_at = Utc::now();
                            post.touch();
                        })
                        .await?;

                    let entry = self.refresh_ticker_snapshot(post_id, ticker, &post).await?;
                    events
                        .emit(RunEvent::TickerDone {
                            ticker: ticker.clone(),
                            suggestion,
                            current: entry.current,
                            pct: entry.pct,
                        })
                        .await;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    if is_benign_memory_collision(&message) {
                        // Idempotent re-run: keep whatever verdict is recorded.
                        tracing::warn!(
                            ticker = %ticker,
                            post_id = %post_id,
                            "engine memory collection already exists; keeping prior verdict"
                        );
                        self.append_log(
                            post_id,
                            &format!("{ticker}: warning Memory collection already exists; reusing existing memory."),
                        )
                        .await?;

                        let suggestion = self
                            .store
                            .find(post_id)
                            .await
                            .map(|p| p.suggestion_for(ticker))
                            .unwrap_or_default();
                        let entry = self.refresh_ticker_snapshot(post_id, ticker, &post).await?;
                        events
                            .emit(RunEvent::TickerDone {
                                ticker: ticker.clone(),
                                suggestion,
                                current: entry.current,
                                pct: entry.pct,
                            })
                            .await;
                    } else {
                        tracing::error!(
                            ticker = %ticker,
                            post_id = %post_id,
                            error = %message,
                            "ticker analysis failed"
                        );
                        self.append_log(post_id, &format!("{ticker}: error {message}"))
                            .await?;

                        let ticker_owned = ticker.clone();
                        let error_value = json!({ "error": message.clone() });
                        self.store
                            .transaction(post_id, move |post| {
                                let previous = post.suggestion_for(&ticker_owned);
                                let analysis = post.analysis_mut();
                                analysis.per_ticker.insert(
                                    ticker_owned,
                                    TickerVerdict {
                                        suggestion: previous,
                                        signals: error_value,
                                    },
                                );
                                analysis.updated_at = Utc::now();
                                post.touch();
                            })
                            .await?;
                        events
                            .emit(RunEvent::TickerError {
                                ticker: ticker.clone(),
                                error: message,
                            })
                            .await;
                    }
                }
            }
        }

        // Rebuild the summary in the post's ticker order.
        let date_label = as_of_date.to_string();
        let per = self
            .store
            .find(post_id)
            .await
            .and_then(|p| p.analysis)
            .map(|a| a.per_ticker)
            .unwrap_or_default();
        let lines: Vec<String> = tickers
            .iter()
            .map(|ticker| {
                let suggestion = per.get(ticker).map(|v| v.suggestion).unwrap_or_default();
                format!("{ticker}: {suggestion} ({date_label})")
            })
            .collect();
        let summary = lines.join("\n");
        self.store
            .transaction(post_id, move |post| {
                let analysis = post.analysis_mut();
                analysis.summary = summary;
                analysis.updated_at = Utc::now();
                post.touch();
            })
            .await?;

        events
            .emit(RunEvent::Done {
                id: post_id.to_string(),
            })
            .await;
        Ok(true)
    }

    /// Drive one engine session to completion, appending and emitting log
    /// chunks as they arrive. Returns the final outcome plus the last explicit
    /// decision seen in the transcript.
    async fn drive_ticker(
        &self,
        post_id: &str,
        ticker: &str,
        as_of_date: NaiveDate,
        config: &EngineConfig,
        events: &Emitter,
    ) -> Result<(EngineOutcome, Option<Suggestion>)> {
        let session = self
            .engine
            .configure(config)
            .await
            .context("engine session construction failed")?;
        let mut stream = session.stream(ticker, as_of_date).await?;

        let mut last_seen = None;
        let mut outcome = None;
        while let Some(chunk) = stream.next().await {
            match chunk? {
                EngineChunk::Log(text) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    self.append_log(post_id, &format!("{ticker}: {text}")).await?;
                    events
                        .emit(RunEvent::Log {
                            ticker: ticker.to_string(),
                            message: text.to_string(),
                        })
                        .await;
                    if let Some(seen) = decision::scan_decision(text) {
                        last_seen = Some(seen);
                    }
                }
                EngineChunk::Result(result) => outcome = Some(result),
            }
        }

        let outcome = outcome.context("engine stream ended without a final result")?;
        Ok((outcome, last_seen))
    }

    async fn refresh_ticker_snapshot(
        &self,
        post_id: &str,
        ticker: &str,
        post: &Post,
    ) -> Result<SnapshotEntry> {
        let purchase = post.purchases.price_for(ticker);
        let entry = snapshot::snapshot_ticker(self.feed.as_ref(), ticker, purchase).await;

        let ticker_owned = ticker.to_string();
        self.store
            .transaction(post_id, move |post| {
                post.snapshot.insert(ticker_owned, entry);
                post.touch();
            })
            .await?;
        Ok(entry)
    }

    /// Append one wrapped line to the post's cumulative report. The report
    /// only ever grows.
    async fn append_log(&self, post_id: &str, line: &str) -> Result<()> {
        let wrapped = wrap_text(line, REPORT_WRAP_COLUMNS);
        self.store
            .transaction(post_id, move |post| {
                let analysis = post.analysis_mut();
                if !analysis.report.is_empty() {
                    analysis.report.push('\n');
                }
                analysis.report.push_str(&wrapped);
                analysis.updated_at = Utc::now();
                post.touch();
            })
            .await?;
        Ok(())
    }

    /// Engine-unavailable terminal: one log append, one error event.
    async fn abort_run(&self, post_id: &str, events: &Emitter, message: String) -> Result<()> {
        self.append_log(post_id, &format!("ERROR: {message}")).await?;
        events.emit(RunEvent::Error { message }).await;
        Ok(())
    }
}

fn is_benign_memory_collision(message: &str) -> bool {
    message.contains("already exists") && message.to_lowercase().contains("memory")
}

/// Word-wrap at a fixed column, breaking at the last space in each window and
/// hard-cutting tokens longer than the width.
pub fn wrap_text(text: &str, width: usize) -> String {
    let mut out = Vec::new();
    for line in text.lines() {
        wrap_line(line, width, &mut out);
    }
    out.join("\n")
}

fn wrap_line(line: &str, width: usize, out: &mut Vec<String>) {
    let chars: Vec<char> = line.chars().collect();
    let total = chars.len();
    if total <= width {
        out.push(line.to_string());
        return;
    }

    let mut start = 0;
    while start < total {
        let end = (start + width).min(total);
        if end == total {
            out.push(chars[start..end].iter().collect());
            break;
        }
        match chars[start..end].iter().rposition(|c| *c == ' ') {
            Some(rel) if rel > 0 => {
                out.push(chars[start..start + rel].iter().collect());
                start += rel + 1;
            }
            _ => {
                out.push(chars[start..end].iter().collect());
                start = end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::post::Purchases;
    use crate::engine::{EngineSession, EngineStream};
    use crate::pricefeed::PriceHistory;
    use serde_json::{Map, Value};
    use std::collections::{BTreeMap, HashMap};

    struct ScriptedEngine {
        fail_configure: bool,
        tickers: HashMap<String, Script>,
    }

    impl ScriptedEngine {
        fn new(tickers: HashMap<String, Script>) -> Self {
            Self {
                fail_configure: false,
                tickers,
            }
        }

        fn unavailable() -> Self {
            Self {
                fail_configure: true,
                tickers: HashMap::new(),
            }
        }
    }

    #[derive(Clone)]
    enum Script {
        Chunks(Vec<ScriptChunk>),
        Fail(String),
    }

    #[derive(Clone)]
    enum ScriptChunk {
        Log(&'static str),
        Result(Option<&'static str>, Value),
    }

    #[async_trait::async_trait]
    impl AnalysisEngine for ScriptedEngine {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn configure(&self, _config: &EngineConfig) -> Result<Box<dyn EngineSession>> {
            anyhow::ensure!(!self.fail_configure, "engine backend not reachable");
            Ok(Box::new(ScriptedSession {
                tickers: self.tickers.clone(),
            }))
        }
    }

    struct ScriptedSession {
        tickers: HashMap<String, Script>,
    }

    #[async_trait::async_trait]
    impl EngineSession for ScriptedSession {
        async fn stream(&self, ticker: &str, _as_of_date: NaiveDate) -> Result<EngineStream> {
            match self.tickers.get(ticker).cloned() {
                Some(Script::Fail(message)) => Err(anyhow::anyhow!(message)),
                Some(Script::Chunks(chunks)) => {
                    let items: Vec<Result<EngineChunk>> = chunks
                        .into_iter()
                        .map(|chunk| {
                            Ok(match chunk {
                                ScriptChunk::Log(text) => EngineChunk::Log(text.to_string()),
                                ScriptChunk::Result(decision, signals) => {
                                    EngineChunk::Result(EngineOutcome {
                                        decision: decision.map(str::to_string),
                                        signals,
                                    })
                                }
                            })
                        })
                        .collect();
                    Ok(Box::pin(futures_util::stream::iter(items)))
                }
                None => Err(anyhow::anyhow!("no script for {ticker}")),
            }
        }
    }

    struct FixedFeed(Option<f64>);

    #[async_trait::async_trait]
    impl PriceFeed for FixedFeed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn latest_price(&self, _ticker: &str) -> Result<Option<f64>> {
            Ok(self.0)
        }

        async fn history(&self, _t: &str, _p: &str, _i: &str) -> Result<PriceHistory> {
            Ok(PriceHistory::default())
        }
    }

    fn temp_store() -> Arc<PostStore> {
        let dir = std::env::temp_dir().join(format!("watchpost-pipeline-{}", uuid::Uuid::new_v4()));
        Arc::new(PostStore::new(dir.join("posts.json")).unwrap())
    }

    fn dated_options() -> Map<String, Value> {
        let mut options = Map::new();
        options.insert("date".to_string(), json!("2026-03-02"));
        options
    }

    fn post_with(tickers: &[&str], purchases: Purchases) -> Post {
        let tickers: Vec<String> = tickers.iter().map(|s| s.to_string()).collect();
        Post::new("basket", "", &tickers, dated_options(), purchases)
    }

    fn pipeline(
        store: Arc<PostStore>,
        engine: ScriptedEngine,
        feed: FixedFeed,
    ) -> AnalysisPipeline {
        AnalysisPipeline::new(store, Arc::new(engine), Arc::new(feed))
    }

    fn buy_script() -> Script {
        Script::Chunks(vec![
            ScriptChunk::Log("weighing fundamentals against sentiment"),
            ScriptChunk::Log("FINAL TRADE DECISION: BUY"),
            ScriptChunk::Result(Some("BUY"), json!({"final_trade_decision": "BUY"})),
        ])
    }

    async fn drain(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn run_records_verdict_snapshot_and_summary() {
        let store = temp_store();
        let mut purchases = BTreeMap::new();
        purchases.insert("AAPL".to_string(), 100.0);
        let post = post_with(&["AAPL"], Purchases::PerTicker(purchases));
        let id = post.id.clone();
        store.insert(post).await.unwrap();

        let engine = ScriptedEngine::new(HashMap::from([("AAPL".to_string(), buy_script())]));
        let pipeline = pipeline(store, engine, FixedFeed(Some(150.0)));

        let updated = pipeline.run(&id).await.unwrap().unwrap();
        let analysis = updated.analysis.unwrap();
        assert_eq!(analysis.per_ticker["AAPL"].suggestion, Suggestion::Buy);
        assert_eq!(
            analysis.per_ticker["AAPL"].signals["final_trade_decision"],
            json!("BUY")
        );
        assert!(analysis.report.contains("AAPL: weighing fundamentals"));
        assert_eq!(analysis.summary, "AAPL: Buy (2026-03-02)");

        let entry = updated.snapshot["AAPL"];
        assert_eq!(entry.current, Some(150.0));
        assert_eq!(entry.pct, Some(50.0));
    }

    #[tokio::test]
    async fn summary_covers_every_ticker_in_order() {
        let store = temp_store();
        let post = post_with(&["AAPL", "MSFT"], Purchases::default());
        let id = post.id.clone();
        store.insert(post).await.unwrap();

        let engine = ScriptedEngine::new(HashMap::from([
            ("AAPL".to_string(), buy_script()),
            (
                "MSFT".to_string(),
                Script::Chunks(vec![ScriptChunk::Result(None, Value::Null)]),
            ),
        ]));
        let pipeline = pipeline(store, engine, FixedFeed(None));

        let updated = pipeline.run(&id).await.unwrap().unwrap();
        let summary = updated.analysis.unwrap().summary;
        assert_eq!(
            summary,
            "AAPL: Buy (2026-03-02)\nMSFT: Hold (2026-03-02)"
        );
    }

    #[tokio::test]
    async fn transcript_fallback_decides_when_result_has_no_decision() {
        let store = temp_store();
        let post = post_with(&["TSLA"], Purchases::default());
        let id = post.id.clone();
        store.insert(post).await.unwrap();

        let engine = ScriptedEngine::new(HashMap::from([(
            "TSLA".to_string(),
            Script::Chunks(vec![
                ScriptChunk::Log("leaning buy early on"),
                ScriptChunk::Log("FINAL PROPOSAL: SELL"),
                ScriptChunk::Result(None, Value::Null),
            ]),
        )]));
        let pipeline = pipeline(store, engine, FixedFeed(None));

        let updated = pipeline.run(&id).await.unwrap().unwrap();
        assert_eq!(
            updated.analysis.unwrap().per_ticker["TSLA"].suggestion,
            Suggestion::Sell
        );
    }

    #[tokio::test]
    async fn streaming_emits_ordered_events_and_matches_batch_state() {
        let scripts = || {
            HashMap::from([
                ("AAPL".to_string(), buy_script()),
                (
                    "MSFT".to_string(),
                    Script::Chunks(vec![ScriptChunk::Result(Some("sell"), Value::Null)]),
                ),
            ])
        };

        let store_a = temp_store();
        let post_a = post_with(&["AAPL", "MSFT"], Purchases::Uniform(100.0));
        let id_a = post_a.id.clone();
        store_a.insert(post_a).await.unwrap();
        let streaming = pipeline(
            store_a.clone(),
            ScriptedEngine::new(scripts()),
            FixedFeed(Some(150.0)),
        );

        let store_b = temp_store();
        let post_b = post_with(&["AAPL", "MSFT"], Purchases::Uniform(100.0));
        let id_b = post_b.id.clone();
        store_b.insert(post_b).await.unwrap();
        let batch = pipeline(
            store_b.clone(),
            ScriptedEngine::new(scripts()),
            FixedFeed(Some(150.0)),
        );

        let (tx, rx) = mpsc::channel(256);
        assert!(streaming.run_streaming(&id_a, tx).await.unwrap());
        batch.run(&id_b).await.unwrap();

        let types: Vec<String> = drain(rx)
            .await
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            types,
            vec![
                "start",
                "ticker-start",
                "log",
                "log",
                "ticker-done",
                "ticker-start",
                "ticker-done",
                "done"
            ]
        );

        // Same persisted end state, timestamps aside.
        let a = store_a.find(&id_a).await.unwrap();
        let b = store_b.find(&id_b).await.unwrap();
        let (a_analysis, b_analysis) = (a.analysis.unwrap(), b.analysis.unwrap());
        assert_eq!(a_analysis.report, b_analysis.report);
        assert_eq!(a_analysis.summary, b_analysis.summary);
        assert_eq!(
            serde_json::to_value(&a_analysis.per_ticker).unwrap(),
            serde_json::to_value(&b_analysis.per_ticker).unwrap()
        );
        assert_eq!(a.snapshot, b.snapshot);
    }

    #[tokio::test]
    async fn unavailable_engine_aborts_without_touching_verdicts() {
        let store = temp_store();
        let post = post_with(&["AAPL"], Purchases::default());
        let id = post.id.clone();
        store.insert(post).await.unwrap();
        store
            .transaction(&id, |post| {
                post.analysis_mut().per_ticker.insert(
                    "AAPL".to_string(),
                    TickerVerdict {
                        suggestion: Suggestion::Buy,
                        signals: Value::Null,
                    },
                );
            })
            .await
            .unwrap();

        let pipeline = pipeline(store.clone(), ScriptedEngine::unavailable(), FixedFeed(None));

        let (tx, rx) = mpsc::channel(256);
        assert!(pipeline.run_streaming(&id, tx).await.unwrap());

        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RunEvent::Start { .. }));
        assert!(matches!(events[1], RunEvent::Error { .. }));

        let post = store.find(&id).await.unwrap();
        let analysis = post.analysis.unwrap();
        assert_eq!(analysis.per_ticker["AAPL"].suggestion, Suggestion::Buy);
        assert!(analysis.report.contains("ERROR: analysis engine unavailable"));
    }

    #[tokio::test]
    async fn benign_memory_collision_keeps_prior_verdict() {
        let store = temp_store();
        let post = post_with(&["AAPL"], Purchases::default());
        let id = post.id.clone();
        store.insert(post).await.unwrap();
        store
            .transaction(&id, |post| {
                post.analysis_mut().per_ticker.insert(
                    "AAPL".to_string(),
                    TickerVerdict {
                        suggestion: Suggestion::Buy,
                        signals: json!({"final_trade_decision": "BUY"}),
                    },
                );
            })
            .await
            .unwrap();

        let engine = ScriptedEngine::new(HashMap::from([(
            "AAPL".to_string(),
            Script::Fail("Collection AAPL_memory already exists in the memory store".to_string()),
        )]));
        let pipeline = pipeline(store.clone(), engine, FixedFeed(None));

        let (tx, rx) = mpsc::channel(256);
        assert!(pipeline.run_streaming(&id, tx).await.unwrap());

        let events = drain(rx).await;
        assert!(!events.iter().any(|e| matches!(e, RunEvent::TickerError { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::TickerDone { suggestion: Suggestion::Buy, .. }
        )));

        let post = store.find(&id).await.unwrap();
        let analysis = post.analysis.unwrap();
        assert_eq!(analysis.per_ticker["AAPL"].suggestion, Suggestion::Buy);
        assert_eq!(
            analysis.per_ticker["AAPL"].signals["final_trade_decision"],
            json!("BUY")
        );
        assert!(analysis.report.contains("warning Memory collection already exists"));
    }

    #[tokio::test]
    async fn ticker_failure_degrades_to_hold_and_continues() {
        let store = temp_store();
        let post = post_with(&["AAPL", "MSFT"], Purchases::default());
        let id = post.id.clone();
        store.insert(post).await.unwrap();

        let engine = ScriptedEngine::new(HashMap::from([
            (
                "AAPL".to_string(),
                Script::Fail("engine exploded mid-debate".to_string()),
            ),
            ("MSFT".to_string(), buy_script()),
        ]));
        let pipeline = pipeline(store.clone(), engine, FixedFeed(None));

        let (tx, rx) = mpsc::channel(256);
        assert!(pipeline.run_streaming(&id, tx).await.unwrap());

        let events = drain(rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::TickerError { ticker, .. } if ticker == "AAPL"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::TickerDone { ticker, .. } if ticker == "MSFT"
        )));

        let post = store.find(&id).await.unwrap();
        let analysis = post.analysis.unwrap();
        assert_eq!(analysis.per_ticker["AAPL"].suggestion, Suggestion::Hold);
        assert!(analysis.per_ticker["AAPL"].signals["error"]
            .as_str()
            .unwrap()
            .contains("engine exploded"));
        assert_eq!(analysis.per_ticker["MSFT"].suggestion, Suggestion::Buy);
        assert_eq!(
            analysis.summary,
            "AAPL: Hold (2026-03-02)\nMSFT: Buy (2026-03-02)"
        );
    }

    #[tokio::test]
    async fn run_all_captures_per_post_outcomes() {
        let store = temp_store();
        let good = post_with(&["AAPL"], Purchases::default());
        let bad = post_with(&["MISSING"], Purchases::default());
        store.insert(good).await.unwrap();
        store.insert(bad).await.unwrap();

        let engine = ScriptedEngine::new(HashMap::from([("AAPL".to_string(), buy_script())]));
        let pipeline = pipeline(store, engine, FixedFeed(None));

        let entries = pipeline.run_all().await;
        assert_eq!(entries.len(), 2);
        // A missing script degrades inside the run; both posts still complete.
        assert!(entries.iter().all(|e| matches!(e, FleetEntry::Updated(_))));
    }

    #[tokio::test]
    async fn summarize_prefers_verdicts_then_report_then_hold() {
        let store = temp_store();
        let post = post_with(&["AAPL", "MSFT", "TSLA"], Purchases::default());
        let id = post.id.clone();
        store.insert(post).await.unwrap();
        store
            .transaction(&id, |post| {
                let analysis = post.analysis_mut();
                analysis.per_ticker.insert(
                    "AAPL".to_string(),
                    TickerVerdict {
                        suggestion: Suggestion::Buy,
                        signals: Value::Null,
                    },
                );
                analysis.report = "MSFT: final decision sell".to_string();
            })
            .await
            .unwrap();

        let engine = ScriptedEngine::new(HashMap::new());
        let pipeline = pipeline(store, engine, FixedFeed(None));

        let updated = pipeline.summarize(&id).await.unwrap().unwrap();
        assert_eq!(
            updated.analysis.unwrap().summary,
            "AAPL: Buy (2026-03-02)\nMSFT: Sell (2026-03-02)\nTSLA: Hold (2026-03-02)"
        );
    }

    #[test]
    fn wrap_breaks_at_spaces_within_the_window() {
        assert_eq!(wrap_text("aaaa bbbb cccc", 9), "aaaa\nbbbb cccc");
        assert_eq!(wrap_text("short line", 120), "short line");
    }

    #[test]
    fn wrap_hard_cuts_unbreakable_tokens() {
        assert_eq!(wrap_text("abcdefghij", 4), "abcd\nefgh\nij");
    }

    #[test]
    fn event_wire_format_uses_kebab_case_tags() {
        let event = RunEvent::TickerDone {
            ticker: "AAPL".to_string(),
            suggestion: Suggestion::Buy,
            current: Some(150.0),
            pct: Some(50.0),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("ticker-done"));
        assert_eq!(value["suggestion"], json!("Buy"));
    }
}
