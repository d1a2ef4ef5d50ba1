//! Axum HTTP server, routing, and middleware.
//!
//! # Responsibilities
//! - Define the Axum router with all routes and shared middleware.
//! - Inject shared application state (`AppState`) into handlers.
//! - Stream forward events to browsers as server-sent events.

pub mod error;
pub mod events;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
