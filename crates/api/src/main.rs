use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watchpost_core::config::Settings;
use watchpost_core::domain::post::{normalize_tickers, normalize_title, Post, Purchases};
use watchpost_core::engine::http::HttpAnalysisEngine;
use watchpost_core::engine::stub::StubEngine;
use watchpost_core::engine::AnalysisEngine;
use watchpost_core::pipeline::{AnalysisPipeline, FleetEntry, RunEvent};
use watchpost_core::pricefeed::http::HttpPriceFeed;
use watchpost_core::pricefeed::stub::StubPriceFeed;
use watchpost_core::pricefeed::{PriceFeed, PriceHistory};
use watchpost_core::snapshot;
use watchpost_core::storage::PostStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let store = Arc::new(PostStore::new(settings.data_file())?);

    // Collaborators degrade to stubs when unconfigured; the server still runs.
    let engine: Arc<dyn AnalysisEngine> = match HttpAnalysisEngine::from_settings(&settings) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            tracing::warn!(error = %err, "analysis engine not configured; runs will record Hold placeholders");
            Arc::new(StubEngine)
        }
    };
    let feed: Arc<dyn PriceFeed> = match HttpPriceFeed::from_settings(&settings) {
        Ok(feed) => Arc::new(feed),
        Err(err) => {
            tracing::warn!(error = %err, "price feed not configured; snapshots will read as absent");
            Arc::new(StubPriceFeed)
        }
    };

    let pipeline = Arc::new(AnalysisPipeline::new(
        store.clone(),
        engine.clone(),
        feed.clone(),
    ));

    let auto_regen = std::env::var("AUTO_REGEN").map(|v| v != "0").unwrap_or(true);
    if auto_regen {
        tokio::spawn(watchpost_core::schedule::run_daily_loop(pipeline.clone()));
    }

    let state = AppState {
        store,
        pipeline,
        engine,
        feed,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/config", get(api_config))
        .route("/api/posts", get(list_posts).post(create_post))
        .route("/api/posts/reorder", post(reorder_posts))
        .route("/api/posts/:id", put(update_post).delete(delete_post))
        .route("/api/posts/:id/analyze", post(analyze_post))
        .route("/api/posts/:id/analyze/stream", get(analyze_post_stream))
        .route("/api/posts/:id/summarize", post(summarize_post))
        .route("/api/posts/:id/snapshot", get(refresh_snapshot))
        .route("/api/analyze-all", post(analyze_all))
        .route("/api/chart", get(chart))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5055);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    store: Arc<PostStore>,
    pipeline: Arc<AnalysisPipeline>,
    engine: Arc<dyn AnalysisEngine>,
    feed: Arc<dyn PriceFeed>,
}

async fn api_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "server": true,
        "engine": state.engine.name(),
        "price_feed": state.feed.name(),
    }))
}

async fn list_posts(State(state): State<AppState>) -> Json<Vec<Post>> {
    Json(state.store.list().await)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreatePostRequest {
    title: String,
    description: String,
    tickers: Vec<String>,
    options: Map<String, Value>,
    purchases: Option<Purchases>,
}

async fn create_post(
    State(state): State<AppState>,
    Json(payload): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Post>), StatusCode> {
    let post = Post::new(
        &payload.title,
        &payload.description,
        &payload.tickers,
        payload.options,
        payload.purchases.unwrap_or_default(),
    );

    state.store.insert(post.clone()).await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok((StatusCode::CREATED, Json(post)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdatePostRequest {
    title: Option<String>,
    description: Option<String>,
    tickers: Option<Vec<String>>,
    options: Option<Map<String, Value>>,
    purchases: Option<Purchases>,
}

async fn update_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdatePostRequest>,
) -> Result<Json<Post>, StatusCode> {
    let updated = state
        .store
        .transaction(&id, move |post| {
            if let Some(title) = payload.title {
                post.title = normalize_title(&title);
            }
            if let Some(description) = payload.description {
                post.description = description.trim().to_string();
            }
            if let Some(tickers) = payload.tickers {
                post.tickers = normalize_tickers(&tickers);
            }
            if let Some(options) = payload.options {
                post.options = options;
            }
            if let Some(purchases) = payload.purchases {
                post.purchases = purchases;
            }
            post.touch();
        })
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !updated {
        return Err(StatusCode::NOT_FOUND);
    }
    state.store.find(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn delete_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let removed = state.store.remove(&id).await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if !removed {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({"message": "deleted"})))
}

async fn reorder_posts(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let order: Vec<String> = match payload.get("order") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(_) => return Err(StatusCode::BAD_REQUEST),
    };

    let order = state.store.reorder(&order).await.map_err(|e| {
        sentry_anyhow::capture_anyhow(&e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(json!({"message": "ok", "order": order})))
}

async fn analyze_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Post>, StatusCode> {
    state
        .pipeline
        .run(&id)
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn summarize_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Post>, StatusCode> {
    state
        .pipeline
        .summarize(&id)
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn refresh_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Post>, StatusCode> {
    snapshot::refresh_snapshot(&state.store, state.feed.as_ref(), &id)
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn analyze_all(State(state): State<AppState>) -> Json<Vec<FleetEntry>> {
    Json(state.pipeline.run_all().await)
}

/// SSE progress stream for one analysis run. The run is fire-and-forget: a
/// disconnecting client does not stop the store updates.
async fn analyze_post_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    if state.store.find(&id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let (tx, rx) = mpsc::channel::<RunEvent>(64);
    let pipeline = state.pipeline.clone();
    let post_id = id.clone();
    tokio::spawn(async move {
        if let Err(err) = pipeline.run_streaming(&post_id, tx.clone()).await {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(post_id = %post_id, error = %err, "streaming analysis run failed");
            let _ = tx
                .send(RunEvent::Error {
                    message: format!("{err:#}"),
                })
                .await;
        }
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .map(|event| Event::default().json_data(&event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct ChartQuery {
    #[serde(default)]
    ticker: String,
    period: Option<String>,
    interval: Option<String>,
}

async fn chart(
    State(state): State<AppState>,
    Query(query): Query<ChartQuery>,
) -> Json<PriceHistory> {
    let ticker = query.ticker.trim().to_uppercase();
    if ticker.is_empty() {
        return Json(PriceHistory::default());
    }
    let period = query.period.as_deref().unwrap_or("6mo");
    let interval = query.interval.as_deref().unwrap_or("1d");

    match state.feed.history(&ticker, period, interval).await {
        Ok(history) => Json(history),
        Err(err) => {
            tracing::warn!(ticker = %ticker, error = %err, "chart history fetch failed");
            Json(PriceHistory::default())
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
