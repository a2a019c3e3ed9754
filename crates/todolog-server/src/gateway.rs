//! Log Gateway: a narrow proxy in front of the shape log service.
//!
//! Only allow-listed protocol parameters reach the upstream, and the
//! collection is pinned server-side regardless of what the client sent. The
//! upstream response is relayed as-is: status, headers and a streamed body.
//! `content-length` and `content-encoding` are dropped because the body is
//! re-chunked and already decoded by the time it leaves here.

use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::{debug, warn};

use todolog_types::COLLECTION;

use crate::AppState;
use crate::constants::{GATEWAY_PARAMS, GATEWAY_PATH};
use crate::error::{ApiError, ApiResult};

/// Connection-scoped headers that never cross a proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn routes() -> Router<AppState> {
    Router::new().route(GATEWAY_PATH, get(proxy_shape))
}

async fn proxy_shape(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let params = forwarded_params(query);
    let url = state.upstream_shape_url();
    debug!(%url, ?params, "proxying shape request");

    let upstream = state
        .http
        .get(&url)
        .query(&params)
        .headers(forwarded_request_headers(&headers))
        .send()
        .await
        .map_err(|e| {
            warn!(%url, error = %e, "log service unreachable");
            ApiError::upstream_unavailable(format!("log service unreachable: {e}"))
        })?;

    let status = upstream.status();
    if !status.is_success() {
        debug!(%status, "relaying upstream error");
    }

    let mut response_headers = upstream.headers().clone();
    strip_response_headers(&mut response_headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Keep allow-listed parameters in order and pin the collection.
fn forwarded_params(query: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = query
        .into_iter()
        .filter(|(key, _)| GATEWAY_PARAMS.contains(&key.as_str()))
        .collect();
    params.push(("table".to_string(), COLLECTION.to_string()));
    params
}

/// Client headers minus `host`, hop-by-hop headers, and `accept-encoding`
/// (the HTTP client negotiates compression with the upstream itself).
fn forwarded_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    forwarded.remove(header::HOST);
    forwarded.remove(header::CONTENT_LENGTH);
    forwarded.remove(header::ACCEPT_ENCODING);
    for name in HOP_BY_HOP {
        forwarded.remove(*name);
    }
    forwarded
}

fn strip_response_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::http::{HeaderValue, Request, StatusCode};
    use axum::response::IntoResponse;
    use axum::Json;
    use serde_json::{Value, json};
    use todolog_store::TodoStore;
    use tower::ServiceExt;

    /// Upstream that echoes what it received.
    async fn spawn_echo_upstream() -> String {
        let app = Router::new().route(
            "/v1/shape",
            get(|Query(params): Query<BTreeMap<String, String>>, headers: HeaderMap| async move {
                let headers: BTreeMap<String, String> = headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                    .collect();
                let mut response = Json(json!({ "params": params, "headers": headers })).into_response();
                response
                    .headers_mut()
                    .insert("x-shape-handle", HeaderValue::from_static("h-1"));
                response
                    .headers_mut()
                    .insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
                response
            }),
        );
        spawn(app).await
    }

    async fn spawn_status_upstream(status: StatusCode, body: &'static str) -> String {
        let app = Router::new().route("/v1/shape", get(move || async move { (status, body) }));
        spawn(app).await
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn gateway(upstream: &str) -> Router {
        let store = Arc::new(TodoStore::in_memory().unwrap());
        crate::router(AppState::new(store, upstream).unwrap())
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    // =========================================================================
    // Parameters and headers
    // =========================================================================

    #[test]
    fn test_forwarded_params_filters_and_pins_table() {
        let query = vec![
            ("table".to_string(), "users".to_string()),
            ("offset".to_string(), "-1".to_string()),
            ("where".to_string(), "1=1".to_string()),
            ("live".to_string(), "true".to_string()),
        ];
        assert_eq!(
            forwarded_params(query),
            vec![
                ("offset".to_string(), "-1".to_string()),
                ("live".to_string(), "true".to_string()),
                ("table".to_string(), "todos".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_gateway_forwards_allow_listed_params_only() {
        let upstream = spawn_echo_upstream().await;
        let request = Request::builder()
            .uri("/api/shape/todos?table=users&offset=-1&live=true&secret=x&cursor=3&handle=h-1")
            .header("x-client", "web")
            .header(header::HOST, "evil.example")
            .body(Body::empty())
            .unwrap();

        let (status, _, body) = call(gateway(&upstream), request).await;
        assert_eq!(status, StatusCode::OK);

        let echo: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            echo["params"],
            json!({ "table": "todos", "offset": "-1", "live": "true", "cursor": "3", "handle": "h-1" })
        );
        assert_eq!(echo["headers"]["x-client"], "web");
        assert_ne!(echo["headers"]["host"], "evil.example");
    }

    #[tokio::test]
    async fn test_gateway_strips_length_and_encoding() {
        let upstream = spawn_echo_upstream().await;
        let request = Request::builder().uri("/api/shape/todos").body(Body::empty()).unwrap();

        let (_, headers, _) = call(gateway(&upstream), request).await;
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get(header::CONTENT_ENCODING).is_none());
        assert_eq!(headers.get("x-shape-handle").unwrap(), "h-1");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[tokio::test]
    async fn test_gateway_relays_upstream_errors_verbatim() {
        let upstream = spawn_status_upstream(StatusCode::CONFLICT, "shape gone").await;
        let request = Request::builder().uri("/api/shape/todos").body(Body::empty()).unwrap();

        let (status, _, body) = call(gateway(&upstream), request).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, b"shape gone");
    }

    #[tokio::test]
    async fn test_gateway_unreachable_upstream_is_502() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = Request::builder().uri("/api/shape/todos").body(Body::empty()).unwrap();
        let (status, _, body) = call(gateway(&format!("http://{addr}")), request).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let error: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "UPSTREAM_UNAVAILABLE");
    }

    // =========================================================================
    // Against the embedded log service
    // =========================================================================

    #[tokio::test]
    async fn test_gateway_over_embedded_service() {
        let store = Arc::new(TodoStore::in_memory().unwrap());
        store
            .create(todolog_types::NewItem::new(todolog_types::ItemId::new("a"), "Buy milk"))
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = AppState::new(Arc::clone(&store), base.clone()).unwrap();
        let app = crate::router(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let response = reqwest::get(format!("{base}/api/shape/todos?offset=-1")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            crate::constants::SHAPE_CONTENT_TYPE
        );
        let text = response.text().await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Buy milk"));
        assert!(lines[1].contains("up-to-date"));
    }
}
