//! Mutation RPC client.
//!
//! [`MutationClient`] is the seam the session calls through; the HTTP
//! implementation talks to the server's `/api/todos/*` routes and carries the
//! caller's trace context in `traceparent` / `tracestate`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;

use todolog_telemetry::{TRACEPARENT_HEADER, TRACESTATE_HEADER, inject_trace_context};
use todolog_types::{
    DeleteRequest, ErrorBody, Item, ItemChanges, ItemId, ItemTxResponse, NewItem, ToggleRequest,
    TxResponse, UpdateRequest, Watermark,
};

use crate::constants::RPC_REQUEST_TIMEOUT;
use crate::pending::Mutation;

/// Errors from mutation RPC calls.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The request never got an answer.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with an error body.
    #[error("{code} ({status}): {message}")]
    Rejected { status: StatusCode, code: String, message: String },
}

impl RpcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Rejected { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, RpcError::Rejected { status, .. } if *status == StatusCode::BAD_REQUEST)
    }
}

/// The Mutation Executor as seen from the client.
#[async_trait]
pub trait MutationClient: Send + Sync + 'static {
    async fn create(&self, item: &NewItem) -> Result<ItemTxResponse, RpcError>;
    async fn update(&self, id: &ItemId, changes: &ItemChanges) -> Result<ItemTxResponse, RpcError>;
    async fn toggle(&self, id: &ItemId) -> Result<ItemTxResponse, RpcError>;
    async fn delete(&self, ids: &[ItemId]) -> Result<TxResponse, RpcError>;
    async fn clear_completed(&self) -> Result<TxResponse, RpcError>;
    async fn list(&self) -> Result<Vec<Item>, RpcError>;
}

/// Run `mutation` and return its watermark (`None` when nothing was written).
pub async fn execute<C>(client: &C, mutation: &Mutation) -> Result<Option<Watermark>, RpcError>
where
    C: MutationClient + ?Sized,
{
    match mutation {
        Mutation::Create(item) => client.create(item).await.map(|r| Some(r.txid)),
        Mutation::Update { id, changes } => client.update(id, changes).await.map(|r| Some(r.txid)),
        Mutation::Toggle { id } => client.toggle(id).await.map(|r| Some(r.txid)),
        Mutation::Delete { ids } => client.delete(ids).await.map(|r| r.txid),
        Mutation::ClearCompleted => client.clear_completed().await.map(|r| r.txid),
    }
}

/// HTTP client for the mutation routes.
#[derive(Clone)]
pub struct HttpMutationClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMutationClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(RPC_REQUEST_TIMEOUT).build()?;
        let base_url: String = base_url.into();
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/todos{path}", self.base_url)
    }

    async fn post<B, R>(&self, path: &str, body: Option<&B>) -> Result<R, RpcError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.http.post(self.url(path));
        let (traceparent, tracestate) = inject_trace_context();
        if !traceparent.is_empty() {
            request = request.header(TRACEPARENT_HEADER, traceparent);
        }
        if !tracestate.is_empty() {
            request = request.header(TRACESTATE_HEADER, tracestate);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        decode(request.send().await?).await
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, RpcError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<R>().await?);
    }

    let body = response.bytes().await?;
    let (code, message) = match serde_json::from_slice::<ErrorBody>(&body) {
        Ok(err) => (err.code, err.message),
        Err(_) => ("HTTP".to_string(), String::from_utf8_lossy(&body).to_string()),
    };
    Err(RpcError::Rejected { status, code, message })
}

#[async_trait]
impl MutationClient for HttpMutationClient {
    async fn create(&self, item: &NewItem) -> Result<ItemTxResponse, RpcError> {
        self.post("/create", Some(item)).await
    }

    async fn update(&self, id: &ItemId, changes: &ItemChanges) -> Result<ItemTxResponse, RpcError> {
        let body = UpdateRequest { id: id.clone(), changes: changes.clone() };
        self.post("/update", Some(&body)).await
    }

    async fn toggle(&self, id: &ItemId) -> Result<ItemTxResponse, RpcError> {
        self.post("/toggle", Some(&ToggleRequest { id: id.clone() })).await
    }

    async fn delete(&self, ids: &[ItemId]) -> Result<TxResponse, RpcError> {
        self.post("/delete", Some(&DeleteRequest { ids: ids.to_vec() })).await
    }

    async fn clear_completed(&self) -> Result<TxResponse, RpcError> {
        self.post::<(), _>("/clear-completed", None).await
    }

    async fn list(&self) -> Result<Vec<Item>, RpcError> {
        let response = self.http.get(self.url("")).send().await?;
        decode(response).await
    }
}
