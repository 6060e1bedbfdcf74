use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watchpost_core::engine::http::HttpAnalysisEngine;
use watchpost_core::engine::stub::StubEngine;
use watchpost_core::engine::AnalysisEngine;
use watchpost_core::pipeline::{AnalysisPipeline, FleetEntry};
use watchpost_core::pricefeed::http::HttpPriceFeed;
use watchpost_core::pricefeed::stub::StubPriceFeed;
use watchpost_core::pricefeed::PriceFeed;
use watchpost_core::storage::PostStore;

#[derive(Debug, Parser)]
#[command(name = "watchpost_worker")]
struct Args {
    /// Analyze a single post; default is every post in the watchlist.
    #[arg(long)]
    post_id: Option<String>,

    /// Analysis as-of date (YYYY-MM-DD). Defaults to today in the reference
    /// timezone, or the date each post carries in its options.
    #[arg(long)]
    as_of_date: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = watchpost_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let as_of_date = args
        .as_of_date
        .as_deref()
        .map(|s| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("invalid --as-of-date: {s}"))
        })
        .transpose()?;

    let store = Arc::new(PostStore::new(settings.data_file())?);

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

    let pipeline = AnalysisPipeline::new(store, engine, feed);

    match args.post_id {
        Some(post_id) => {
            let post = match pipeline.run_with_date(&post_id, as_of_date).await {
                Ok(post) => post.with_context(|| format!("post not found: {post_id}"))?,
                Err(err) => {
                    sentry_anyhow::capture_anyhow(&err);
                    tracing::error!(post_id = %post_id, error = %err, "analysis run failed");
                    return Err(err);
                }
            };
            let summary = post
                .analysis
                .map(|a| a.summary)
                .unwrap_or_default();
            tracing::info!(post_id = %post.id, title = %post.title, %summary, "analysis run finished");
        }
        None => {
            let entries = pipeline.run_all_with_date(as_of_date).await;
            for entry in &entries {
                match entry {
                    FleetEntry::Updated(post) => {
                        tracing::info!(post_id = %post.id, title = %post.title, "post regenerated");
                    }
                    FleetEntry::Failed { id, error } => {
                        tracing::error!(post_id = %id, error = %error, "post regeneration failed");
                    }
                }
            }
            let failed = entries
                .iter()
                .filter(|e| matches!(e, FleetEntry::Failed { .. }))
                .count();
            tracing::info!(posts = entries.len(), failed, "fleet run finished");
        }
    }

    Ok(())
}

fn init_sentry(settings: &watchpost_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
