//! HTTP server for todolog.
//!
//! One axum router serves three surfaces over a shared [`AppState`]:
//!
//! | Route                               | Module      | Role                          |
//! |-------------------------------------|-------------|-------------------------------|
//! | `GET /api/todos`, `POST /api/todos/*` | [`rpc`]   | Mutation RPC                  |
//! | `GET /api/shape/todos`              | [`gateway`] | Log Gateway to the log service |
//! | `GET /v1/shape`                     | [`shape`]   | Embedded shape log service    |
//! | `GET /health`                       |             | Liveness                      |
//!
//! The gateway talks to its upstream over HTTP even when the upstream is the
//! embedded service in the same process, so a separately deployed log service
//! is a configuration change.

pub mod config;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod rpc;
pub mod shape;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use todolog_store::TodoStore;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};

use crate::constants::{SHAPE_PATH, UPSTREAM_CONNECT_TIMEOUT};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    store: Arc<TodoStore>,
    /// Base URL of the upstream shape log service.
    log_service_url: Arc<str>,
    /// Identifies this server's view of the log; clients holding a different
    /// handle must re-fetch.
    shape_handle: Arc<str>,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(store: Arc<TodoStore>, log_service_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .build()?;
        let log_service_url: String = log_service_url.into();
        Ok(Self {
            store,
            log_service_url: log_service_url.trim_end_matches('/').into(),
            shape_handle: uuid::Uuid::new_v4().simple().to_string().into(),
            http,
        })
    }

    pub fn store(&self) -> &Arc<TodoStore> {
        &self.store
    }

    pub fn shape_handle(&self) -> &str {
        &self.shape_handle
    }

    fn upstream_shape_url(&self) -> String {
        format!("{}{SHAPE_PATH}", self.log_service_url)
    }
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(rpc::routes())
        .merge(gateway::routes())
        .merge(shape::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serve until the listener fails or the process receives Ctrl-C.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
}
