//! Market data feeds
//!
//! `CoinGeckoFeed` pages through the public `/coins/markets` endpoint. Rows are
//! decoded straight into `MarketRecord`; fields the transform stage does not
//! use are ignored.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::error::ErrorKind;
use crate::models::MarketRecord;

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
const API_KEY_HEADER: &str = "x-cg-demo-api-key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("parsing error: {0}")]
    Parse(String),

    #[error("invalid feed url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("http error: {0}")]
    Http(String),
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) | Self::Timeout | Self::Http(_) => ErrorKind::Recoverable,
            Self::RateLimited => ErrorKind::RateLimit,
            Self::Status { status, .. } if *status >= 500 => ErrorKind::Recoverable,
            Self::Status { .. } | Self::Parse(_) | Self::InvalidUrl(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub currency: String,
    pub order: String,
    pub pages: u32,
    pub per_page: u32,
    /// Pause between page requests.
    pub page_delay_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            currency: "usd".to_string(),
            order: "market_cap_desc".to_string(),
            pages: 4,
            per_page: 250,
            page_delay_ms: 1_000,
        }
    }
}

impl FeedConfig {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// One page of market rows, 1-based.
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<Vec<MarketRecord>, FeedError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct CoinGeckoFeed {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    currency: String,
    order: String,
}

impl CoinGeckoFeed {
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_client(client, config)
    }

    pub fn with_client(client: Client, config: &FeedConfig) -> Result<Self, FeedError> {
        // a trailing slash keeps the last path segment when joining
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');

        Ok(Self {
            client,
            base_url: Url::parse(&base)?,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            currency: config.currency.clone(),
            order: config.order.clone(),
        })
    }

    pub fn markets_url(&self, page: u32, per_page: u32) -> Result<Url, FeedError> {
        let mut url = self.base_url.join("coins/markets")?;
        url.query_pairs_mut()
            .append_pair("vs_currency", &self.currency)
            .append_pair("order", &self.order)
            .append_pair("per_page", &per_page.to_string())
            .append_pair("page", &page.to_string());
        Ok(url)
    }
}

#[async_trait]
impl MarketDataFeed for CoinGeckoFeed {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<Vec<MarketRecord>, FeedError> {
        let url = self.markets_url(page, per_page)?;
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FeedError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let records: Vec<MarketRecord> = serde_json::from_str(&body)?;
        debug!(page, per_page, rows = records.len(), "fetched market page");
        Ok(records)
    }

    fn name(&self) -> &str {
        "coingecko"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markets_url_has_expected_query() {
        let feed = CoinGeckoFeed::new(&FeedConfig::default()).unwrap();
        let url = feed.markets_url(3, 100).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.coingecko.com/api/v3/coins/markets?vs_currency=usd&order=market_cap_desc&per_page=100&page=3"
        );
    }

    #[test]
    fn test_base_url_with_trailing_slash() {
        let config = FeedConfig {
            base_url: "http://localhost:9000/api/v3/".to_string(),
            ..FeedConfig::default()
        };
        let feed = CoinGeckoFeed::new(&config).unwrap();
        assert_eq!(feed.markets_url(1, 10).unwrap().path(), "/api/v3/coins/markets");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = FeedConfig {
            base_url: "not a url".to_string(),
            ..FeedConfig::default()
        };
        assert!(matches!(CoinGeckoFeed::new(&config), Err(FeedError::InvalidUrl(_))));
    }

    #[test]
    fn test_empty_api_key_is_ignored() {
        let config = FeedConfig {
            api_key: Some(String::new()),
            ..FeedConfig::default()
        };
        let feed = CoinGeckoFeed::new(&config).unwrap();
        assert!(feed.api_key.is_none());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(FeedError::RateLimited.kind(), ErrorKind::RateLimit);
        assert!(FeedError::Timeout.is_retryable());
        let server = FeedError::Status {
            status: 503,
            body: String::new(),
        };
        assert!(server.is_retryable());
        let client = FeedError::Status {
            status: 401,
            body: String::new(),
        };
        assert!(!client.is_retryable());
    }
}
