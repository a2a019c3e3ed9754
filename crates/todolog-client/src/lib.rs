//! todolog client library
//!
//! Keeps an optimistic view of the todo list: writes are applied locally the
//! moment they are issued, sent to the server's mutation RPC, and dropped from
//! the overlay once the change stream has caught up with their watermark.
//!
//! The pieces, bottom-up:
//!
//! - [`pending`]: issued mutations and their overlays
//! - [`reconciler`]: baseline from the stream plus pending overlays
//! - [`shape`]: NDJSON decoding and the live subscription task
//! - [`rpc`]: the [`MutationClient`] seam and its HTTP implementation
//! - [`session`]: the actor that owns a reconciler and drives everything

pub mod config;
pub mod constants;
pub mod pending;
pub mod reconciler;
pub mod rpc;
pub mod session;
pub mod shape;

pub use config::ClientConfig;
pub use pending::{Mutation, MutationId, MutationState, Overlay};
pub use reconciler::{Reconciler, SessionEvent, SyncStatus};
pub use rpc::{HttpMutationClient, MutationClient, RpcError, execute};
pub use session::{
    SessionError, SessionHandle, Snapshot, spawn_session, spawn_session_with_feed, wait_settled,
};
pub use shape::{ShapeDecoder, ShapeError, ShapeSubscriber, StreamItem};

/// Connect to a server over HTTP and start a session.
pub fn connect(config: ClientConfig) -> Result<SessionHandle, SessionError> {
    let client = HttpMutationClient::new(config.server_url.clone())?;
    spawn_session(config, std::sync::Arc::new(client))
}
