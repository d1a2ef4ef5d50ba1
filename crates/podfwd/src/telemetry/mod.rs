//! Structured logging and optional OpenTelemetry span export.
//!
//! Logs are always written to stdout as JSON. When an OTLP endpoint is
//! configured, spans are exported to it via OTLP/gRPC as well.
//!
//! Log level is configurable via `RUST_LOG`, falling back to `LOG_LEVEL`
//! (default: `info`).

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
