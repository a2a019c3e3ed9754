//! todolog server binary
//!
//! ```bash
//! todolog-server --database todos.db --bind 127.0.0.1:3000
//! TODOLOG_LOG_SERVICE_URL=http://logs:3000 todolog-server
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use todolog_server::{AppState, ServerConfig};
use todolog_store::TodoStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _tracing = todolog_telemetry::init_tracing("todolog-server", "info");
    let config = ServerConfig::parse();

    let store = TodoStore::open(&config.database)
        .with_context(|| format!("opening database {}", config.database))?;
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    let local = listener.local_addr()?;

    let log_service_url = config.resolve_log_service_url(local);
    let state = AppState::new(Arc::new(store), log_service_url.clone())
        .context("building upstream HTTP client")?;

    tracing::info!(
        %local,
        database = %config.database,
        log_service = %log_service_url,
        shape_handle = state.shape_handle(),
        "todolog server listening"
    );

    todolog_server::serve(listener, state).await?;
    Ok(())
}
