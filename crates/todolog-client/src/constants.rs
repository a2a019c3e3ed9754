//! Client configuration constants.

use std::time::Duration;

/// Default server base URL for local development.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

/// Gateway path of the todos shape, relative to the server URL.
pub const SHAPE_PATH: &str = "/api/shape/todos";

/// A mutation that has not committed within this interval fails and rolls back.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A committed mutation whose watermark has not surfaced on the stream within
/// this interval raises a sync-lag warning. Its overlay stays.
pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before re-subscribing after the stream drops.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// How often the session checks mutation deadlines.
pub const TIMEOUT_TICK: Duration = Duration::from_millis(500);

/// Per-request timeout for mutation RPC calls.
pub const RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session event broadcast capacity. Slow subscribers lag and skip.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Decoded stream batches buffered between subscriber and session.
pub const STREAM_QUEUE_CAPACITY: usize = 64;
