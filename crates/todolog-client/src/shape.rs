//! Shape stream: NDJSON decoding and the subscription task.
//!
//! The subscriber holds one live GET against the shape endpoint. Every
//! subscription replays the log from the start, so each one begins with a
//! [`StreamItem::Reset`]: the session rebuilds its baseline out of sight and
//! swaps it in at the first `up-to-date`. A dropped connection or a
//! `must-refetch` ends the subscription; the next one starts from scratch
//! after the resubscribe delay.

use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use todolog_types::{Control, ShapeMessage};

/// What the subscriber hands to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// A new subscription is starting; discard the baseline on its
    /// `up-to-date`.
    Reset,
    /// Messages decoded from one received chunk, in order.
    Messages(Vec<ShapeMessage>),
}

/// Errors from one subscription attempt.
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("shape request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("shape endpoint answered {0}")]
    Status(StatusCode),
}

// ============================================================================
// Decoder
// ============================================================================

/// Incremental newline-delimited JSON splitter.
///
/// Chunks may end mid-line; the remainder is kept for the next push.
/// Lines that do not parse are logged and skipped.
#[derive(Debug, Default)]
pub struct ShapeDecoder {
    buf: Vec<u8>,
}

impl ShapeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<ShapeMessage> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(end) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<ShapeMessage>(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    error = %e,
                    line = %String::from_utf8_lossy(line),
                    "skipping malformed shape line"
                ),
            }
        }
        messages
    }

    /// Bytes of an incomplete trailing line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn is_must_refetch(message: &ShapeMessage) -> bool {
    matches!(message, ShapeMessage::Control(c) if c.headers.control == Control::MustRefetch)
}

// ============================================================================
// Subscriber
// ============================================================================

/// How a subscription ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The server closed the body.
    Disconnected,
    MustRefetch,
    /// Nobody is listening any more.
    Closed,
}

pub struct ShapeSubscriber {
    http: reqwest::Client,
    url: String,
    resubscribe_delay: Duration,
    tx: mpsc::Sender<StreamItem>,
}

impl ShapeSubscriber {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        resubscribe_delay: Duration,
        tx: mpsc::Sender<StreamItem>,
    ) -> Self {
        Self { http, url: url.into(), resubscribe_delay, tx }
    }

    /// Run until the receiving side goes away.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        loop {
            match self.subscribe_once().await {
                Ok(StreamEnd::Closed) => break,
                Ok(StreamEnd::MustRefetch) => info!(url = %self.url, "shape must be re-fetched"),
                Ok(StreamEnd::Disconnected) => info!(url = %self.url, "shape stream ended"),
                Err(e) => warn!(url = %self.url, error = %e, "shape subscription failed"),
            }
            if self.tx.is_closed() {
                break;
            }
            tokio::time::sleep(self.resubscribe_delay).await;
        }
        debug!("shape subscriber shutting down");
    }

    async fn subscribe_once(&self) -> Result<StreamEnd, ShapeError> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("offset", "-1"), ("live", "true")])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Ok(StreamEnd::MustRefetch);
        }
        if !status.is_success() {
            return Err(ShapeError::Status(status));
        }

        if self.tx.send(StreamItem::Reset).await.is_err() {
            return Ok(StreamEnd::Closed);
        }
        debug!(url = %self.url, "shape subscribed");

        let mut decoder = ShapeDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let mut messages = decoder.push(&chunk?);

            let refetch = messages.iter().position(is_must_refetch);
            if let Some(at) = refetch {
                messages.truncate(at);
            }
            if !messages.is_empty() && self.tx.send(StreamItem::Messages(messages)).await.is_err() {
                return Ok(StreamEnd::Closed);
            }
            if refetch.is_some() {
                return Ok(StreamEnd::MustRefetch);
            }
        }

        Ok(StreamEnd::Disconnected)
    }
}
