//! Server tunables.

use std::time::Duration;

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Default SQLite database path.
pub const DEFAULT_DATABASE: &str = "todolog.db";

/// Path of the embedded shape log service.
pub const SHAPE_PATH: &str = "/v1/shape";

/// Path of the gateway route for the todos collection.
pub const GATEWAY_PATH: &str = "/api/shape/todos";

/// Live shape streams re-send `up-to-date` when idle this long.
pub const SHAPE_HEARTBEAT: Duration = Duration::from_secs(15);

/// Change-log rows read per page.
pub const SHAPE_PAGE_SIZE: usize = 500;

/// Response header carrying the shape handle.
pub const SHAPE_HANDLE_HEADER: &str = "x-shape-handle";

pub const SHAPE_CONTENT_TYPE: &str = "application/x-ndjson";

/// Protocol parameters the gateway passes through to the log service.
pub const GATEWAY_PARAMS: &[&str] = &["live", "handle", "offset", "cursor", "expired_handle", "log"];

/// Connect timeout for upstream log service requests. There is no overall
/// timeout: live streams stay open indefinitely.
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
