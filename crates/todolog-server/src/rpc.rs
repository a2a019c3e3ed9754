//! Mutation RPC routes.
//!
//! Each write runs on the blocking pool inside a request span linked to the
//! caller's trace context, and answers with the watermark of its transaction.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{Instrument, debug, warn};

use todolog_store::{StoreError, TodoStore};
use todolog_telemetry::{TRACEPARENT_HEADER, TRACESTATE_HEADER, extract_trace_context};
use todolog_types::{
    CreateRequest, DeleteRequest, Item, ItemTxResponse, ToggleRequest, TxResponse, UpdateRequest,
};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/todos", get(list))
        .route("/api/todos/create", post(create))
        .route("/api/todos/update", post(update))
        .route("/api/todos/toggle", post(toggle))
        .route("/api/todos/delete", post(delete))
        .route("/api/todos/clear-completed", post(clear_completed))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Item>>> {
    let items = run_blocking(&state, tracing::Span::current(), |store| store.list()).await?;
    Ok(Json(items))
}

async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> ApiResult<Json<ItemTxResponse>> {
    let Json(new) = body?;
    let span = request_span(&headers, "create");
    let committed = run_blocking(&state, span, move |store| store.create(new)).await?;
    Ok(Json(ItemTxResponse { item: committed.value, txid: committed.txid }))
}

async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> ApiResult<Json<ItemTxResponse>> {
    let Json(req) = body?;
    let span = request_span(&headers, "update");
    let committed =
        run_blocking(&state, span, move |store| store.update(&req.id, &req.changes)).await?;
    Ok(Json(ItemTxResponse { item: committed.value, txid: committed.txid }))
}

async fn toggle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ToggleRequest>, JsonRejection>,
) -> ApiResult<Json<ItemTxResponse>> {
    let Json(req) = body?;
    let span = request_span(&headers, "toggle");
    let committed = run_blocking(&state, span, move |store| store.toggle(&req.id)).await?;
    Ok(Json(ItemTxResponse { item: committed.value, txid: committed.txid }))
}

async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> ApiResult<Json<TxResponse>> {
    let Json(req) = body?;
    let span = request_span(&headers, "delete");
    let txid = run_blocking(&state, span, move |store| store.delete(&req.ids)).await?;
    Ok(Json(TxResponse { txid: Some(txid) }))
}

async fn clear_completed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<TxResponse>> {
    let span = request_span(&headers, "clear_completed");
    let txid = run_blocking(&state, span, |store| store.clear_completed()).await?;
    if txid.is_none() {
        debug!("clear completed: nothing to clear");
    }
    Ok(Json(TxResponse { txid }))
}

/// Span for one mutation, parented to the caller's `traceparent` if present.
fn request_span(headers: &HeaderMap, method: &str) -> tracing::Span {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    extract_trace_context(&header(TRACEPARENT_HEADER), &header(TRACESTATE_HEADER), method)
}

/// Run a store call on the blocking pool inside `span`.
async fn run_blocking<T, F>(state: &AppState, span: tracing::Span, f: F) -> ApiResult<T>
where
    F: FnOnce(&TodoStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(state.store());
    let inner = span.clone();
    let result = tokio::task::spawn_blocking(move || inner.in_scope(|| f(&store)))
        .instrument(span)
        .await
        .map_err(|e| ApiError::internal(format!("mutation task failed: {e}")))?;

    result.map_err(|err| {
        if err.is_client_error() {
            debug!(error = %err, "mutation rejected");
        } else {
            warn!(error = %err, "mutation failed");
        }
        ApiError::from(err)
    })
}
