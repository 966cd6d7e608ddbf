//! Dashboard and JSON API
//!
//! Serves the latest analysis summary as an auto-refreshing HTML page plus a
//! small JSON API for summaries, history and service metrics.

mod render;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::metrics::MetricsCollector;
use crate::store::{MarketStore, StoreError};

pub use render::{escape_html, render_dashboard};

const DEFAULT_HISTORY_LIMIT: usize = 10;
const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub bind_address: String,
    pub port: u16,
    /// Page auto-refresh interval.
    pub refresh_secs: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            refresh_secs: 300,
        }
    }
}

impl DashboardConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, DashboardError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|_| DashboardError::InvalidAddress(format!("{}:{}", self.bind_address, self.port)))
    }
}

#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("invalid bind address {0}")]
    InvalidAddress(String),

    #[error("failed to bind dashboard server: {0}")]
    Bind(#[from] warp::Error),
}

/// Rejection carrying an HTTP status for `handle_rejection`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl warp::reject::Reject for ApiError {}

fn store_rejection(err: StoreError) -> Rejection {
    tracing::error!(error = %err, "dashboard store read failed");
    warp::reject::custom(ApiError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: err.to_string(),
    })
}

pub struct DashboardServer {
    store: Arc<dyn MarketStore>,
    metrics: Arc<MetricsCollector>,
    config: DashboardConfig,
}

/// Running server. Dropping the handle leaves the server running; call
/// `stop` for a graceful shutdown.
pub struct DashboardHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl DashboardHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "dashboard server task ended abnormally");
        }
        tracing::info!(addr = %self.addr, "dashboard server stopped");
    }
}

impl DashboardServer {
    pub fn new(
        store: Arc<dyn MarketStore>,
        metrics: Arc<MetricsCollector>,
        config: DashboardConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let refresh_secs = self.config.refresh_secs;

        let index = warp::path::end()
            .and(warp::get())
            .and(with_store(store.clone()))
            .and(warp::any().map(move || refresh_secs))
            .and_then(get_dashboard);

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&json!({
                    "status": "ok",
                    "service": "coinpulse-dashboard",
                    "timestamp": chrono::Utc::now()
                }))
            });

        let latest = warp::path!("api" / "v1" / "summary" / "latest")
            .and(warp::get())
            .and(with_store(store.clone()))
            .and_then(get_latest_summary);

        let history = warp::path!("api" / "v1" / "summaries")
            .and(warp::get())
            .and(warp::query::<HistoryQuery>())
            .and(with_store(store))
            .and_then(get_summaries);

        let service_metrics = warp::path!("api" / "v1" / "metrics")
            .and(warp::get())
            .and(with_metrics(metrics))
            .and_then(get_metrics);

        let cors = warp::cors()
            .allow_any_origin()
            .allow_headers(vec!["content-type"])
            .allow_methods(vec!["GET", "OPTIONS"]);

        index
            .or(health)
            .or(latest)
            .or(history)
            .or(service_metrics)
            .with(cors)
            .recover(handle_rejection)
    }

    /// Bind and serve in a background task.
    pub fn start(&self) -> Result<DashboardHandle, DashboardError> {
        let addr = self.config.socket_addr()?;
        let (shutdown, rx) = oneshot::channel::<()>();

        let (addr, server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, async {
                let _ = rx.await;
            })?;
        let task = tokio::spawn(server);

        tracing::info!(%addr, refresh_secs = self.config.refresh_secs, "dashboard server listening");
        Ok(DashboardHandle {
            addr,
            shutdown,
            task,
        })
    }
}

fn with_store(
    store: Arc<dyn MarketStore>,
) -> impl Filter<Extract = (Arc<dyn MarketStore>,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

fn with_metrics(
    metrics: Arc<MetricsCollector>,
) -> impl Filter<Extract = (Arc<MetricsCollector>,), Error = Infallible> + Clone {
    warp::any().map(move || metrics.clone())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn get_dashboard(
    store: Arc<dyn MarketStore>,
    refresh_secs: u64,
) -> Result<impl Reply, Rejection> {
    let latest = store.latest_summary().await.map_err(store_rejection)?;
    Ok(warp::reply::html(render_dashboard(latest.as_ref(), refresh_secs)))
}

async fn get_latest_summary(store: Arc<dyn MarketStore>) -> Result<warp::reply::Response, Rejection> {
    match store.latest_summary().await.map_err(store_rejection)? {
        Some(summary) => Ok(warp::reply::json(&summary).into_response()),
        None => Err(warp::reject::custom(ApiError {
            status: StatusCode::NOT_FOUND,
            message: "No data available".to_string(),
        })),
    }
}

async fn get_summaries(
    query: HistoryQuery,
    store: Arc<dyn MarketStore>,
) -> Result<impl Reply, Rejection> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let summaries = store.recent_summaries(limit).await.map_err(store_rejection)?;
    Ok(warp::reply::json(&summaries))
}

async fn get_metrics(metrics: Arc<MetricsCollector>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&metrics.get_all_metrics()))
}

/// Handle API errors
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let code;
    let message;

    if err.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = "Endpoint not found";
    } else if let Some(api_error) = err.find::<ApiError>() {
        code = api_error.status;
        message = &api_error.message;
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        code = StatusCode::BAD_REQUEST;
        message = "Invalid query string";
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = StatusCode::METHOD_NOT_ALLOWED;
        message = "Method not allowed";
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal server error";
    }

    let json = warp::reply::json(&json!({
        "error": message,
        "code": code.as_u16()
    }));

    Ok(warp::reply::with_status(json, code))
}
