pub mod decision;
pub mod domain;
pub mod engine;
pub mod pipeline;
pub mod pricefeed;
pub mod schedule;
pub mod snapshot;
pub mod storage;

pub mod config {
    use anyhow::Context;

    const DEFAULT_DATA_FILE: &str = "data/posts.json";

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub data_file: Option<String>,
        pub engine_base_url: Option<String>,
        pub engine_api_key: Option<String>,
        pub price_feed_base_url: Option<String>,
        pub price_feed_api_key: Option<String>,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                data_file: std::env::var("DATA_FILE").ok(),
                engine_base_url: std::env::var("ENGINE_BASE_URL").ok(),
                engine_api_key: std::env::var("ENGINE_API_KEY").ok(),
                price_feed_base_url: std::env::var("PRICE_FEED_BASE_URL").ok(),
                price_feed_api_key: std::env::var("PRICE_FEED_API_KEY").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            })
        }

        pub fn data_file(&self) -> &str {
            self.data_file.as_deref().unwrap_or(DEFAULT_DATA_FILE)
        }

        pub fn require_engine_base_url(&self) -> anyhow::Result<&str> {
            self.engine_base_url
                .as_deref()
                .context("ENGINE_BASE_URL is required")
        }

        pub fn require_price_feed_base_url(&self) -> anyhow::Result<&str> {
            self.price_feed_base_url
                .as_deref()
                .context("PRICE_FEED_BASE_URL is required")
        }
    }
}
