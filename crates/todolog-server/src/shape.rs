//! Embedded shape log service.
//!
//! Serves the change log of the todos table as newline-delimited JSON. A
//! request replays the log from `offset`, ends the backlog with an
//! `up-to-date` control message carrying the committed position, and in live
//! mode keeps the stream open: every commit (or an idle heartbeat) produces
//! the new entries followed by a fresh `up-to-date`.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error};

use todolog_store::{LogBatch, TodoStore};
use todolog_types::{COLLECTION, LogOffset, ShapeMessage, Watermark};

use crate::AppState;
use crate::constants::{
    SHAPE_CONTENT_TYPE, SHAPE_HANDLE_HEADER, SHAPE_HEARTBEAT, SHAPE_PAGE_SIZE, SHAPE_PATH,
};
use crate::error::{ApiError, ApiResult};

pub fn routes() -> Router<AppState> {
    Router::new().route(SHAPE_PATH, get(shape))
}

/// Query parameters understood by the log service.
#[derive(Debug, Default, Deserialize)]
pub struct ShapeParams {
    pub table: Option<String>,
    pub offset: Option<String>,
    pub live: Option<String>,
    pub handle: Option<String>,
}

async fn shape(
    State(state): State<AppState>,
    params: Result<Query<ShapeParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = params?;

    match params.table.as_deref() {
        Some(COLLECTION) => {}
        Some(other) => return Err(ApiError::validation(format!("unknown table '{other}'"))),
        None => return Err(ApiError::validation("missing required parameter 'table'")),
    }

    let offset = match params.offset.as_deref() {
        Some(raw) => raw
            .parse::<LogOffset>()
            .map_err(|e| ApiError::validation(e.to_string()))?,
        None => LogOffset::START,
    };
    let live = params.live.as_deref() == Some("true");

    if let Some(handle) = params.handle.as_deref() {
        if handle != state.shape_handle() {
            debug!(requested = handle, current = state.shape_handle(), "stale shape handle");
            return Ok(must_refetch(state.shape_handle()));
        }
    }

    debug!(%offset, live, "shape request");
    let cursor = ShapeCursor {
        store: Arc::clone(state.store()),
        commits: state.store().subscribe_commits(),
        offset,
        live,
        caught_up: false,
        done: false,
    };
    let body = Body::from_stream(stream::unfold(cursor, ShapeCursor::next_chunk));

    Ok(ndjson_response(StatusCode::OK, state.shape_handle(), body))
}

fn must_refetch(handle: &str) -> Response {
    match ShapeMessage::must_refetch().to_line() {
        Ok(line) => ndjson_response(StatusCode::CONFLICT, handle, Body::from(line)),
        Err(e) => ApiError::internal(format!("encoding control message: {e}")).into_response(),
    }
}

fn ndjson_response(status: StatusCode, handle: &str, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(SHAPE_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Ok(value) = HeaderValue::from_str(handle) {
        headers.insert(SHAPE_HANDLE_HEADER, value);
    }
    response
}

/// Read position of one shape response.
struct ShapeCursor {
    store: Arc<TodoStore>,
    commits: watch::Receiver<Watermark>,
    offset: LogOffset,
    live: bool,
    /// The last chunk reached the end of the log. Only then does the next
    /// read wait for a commit; otherwise the rest of the page run follows
    /// at once.
    caught_up: bool,
    done: bool,
}

impl ShapeCursor {
    /// Produce the next body chunk: log entries, closed by `up-to-date` once
    /// the read reaches the end of the log.
    async fn next_chunk(mut self) -> Option<(Result<Bytes, io::Error>, Self)> {
        if self.done {
            return None;
        }

        if self.caught_up {
            match tokio::time::timeout(SHAPE_HEARTBEAT, self.commits.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return None,
                Err(_) => debug!("shape heartbeat"),
            }
        }

        // Mark the current commit seen before reading, so a commit racing the
        // read wakes the next wait.
        let _ = self.commits.borrow_and_update();

        let store = Arc::clone(&self.store);
        let after = self.offset;
        let batch = tokio::task::spawn_blocking(move || store.read_log(after, SHAPE_PAGE_SIZE))
            .await
            .map_err(io::Error::other)
            .and_then(|r| r.map_err(io::Error::other));

        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "shape log read failed");
                self.done = true;
                return Some((Err(e), self));
            }
        };

        match self.encode(&batch) {
            Ok(chunk) => Some((Ok(chunk), self)),
            Err(e) => {
                error!(error = %e, "shape encode failed");
                self.done = true;
                Some((Err(io::Error::other(e)), self))
            }
        }
    }

    fn encode(&mut self, batch: &LogBatch) -> Result<Bytes, serde_json::Error> {
        let mut buf = String::new();
        for entry in &batch.entries {
            buf.push_str(&entry.to_message().to_line()?);
        }
        self.offset = batch.next_offset(self.offset);

        self.caught_up = !batch.has_more;
        if self.caught_up {
            buf.push_str(&ShapeMessage::up_to_date(batch.txid).to_line()?);
            if !self.live {
                self.done = true;
            }
        }
        Ok(Bytes::from(buf))
    }
}
