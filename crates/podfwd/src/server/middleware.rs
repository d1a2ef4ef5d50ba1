//! Axum middleware settings applied to the router.
//!
//! Includes request tracing, timeout enforcement, and response compression.

use std::time::Duration;

/// Per-request timeout applied to every route except the event stream.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
