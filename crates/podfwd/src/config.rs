//! Configuration loading and validation for the podfwd service.
//!
//! All values are read from environment variables at startup. Every variable is
//! optional; the process exits with a clear error message if one is present but
//! invalid.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port the HTTP API listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address forward listeners bind to.
    #[serde(default = "default_forward_bind_addr")]
    pub forward_bind_addr: String,

    /// Explicit kubeconfig path. When unset the default client chain is used
    /// (`KUBECONFIG`, `~/.kube/config`, in-cluster service account).
    #[serde(default)]
    pub kube_config_path: Option<String>,

    /// Interval (seconds) between SSE keep-alive comments.
    #[serde(default = "default_sse_heartbeat")]
    pub sse_heartbeat_secs: u64,

    /// How long (seconds) open forward connections may drain at shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// OTLP/gRPC collector endpoint. Span export is disabled when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`), used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    3000
}
fn default_forward_bind_addr() -> String {
    "0.0.0.0".into()
}
fn default_sse_heartbeat() -> u64 {
    15
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            forward_bind_addr: default_forward_bind_addr(),
            kube_config_path: None,
            sse_heartbeat_secs: default_sse_heartbeat(),
            shutdown_grace_secs: default_shutdown_grace(),
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let mut c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.normalise();
        c.validate()?;
        Ok(c)
    }

    /// Treat empty optional variables as unset.
    fn normalise(&mut self) {
        self.kube_config_path = self.kube_config_path.take().filter(|s| !s.trim().is_empty());
        self.otel_exporter_otlp_endpoint = self
            .otel_exporter_otlp_endpoint
            .take()
            .filter(|s| !s.trim().is_empty());
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("PORT must be between 1 and 65535");
        }
        self.bind_addr()?;
        if self.sse_heartbeat_secs == 0 {
            anyhow::bail!("SSE_HEARTBEAT_SECS must be > 0");
        }
        if self.log_level.trim().is_empty() {
            anyhow::bail!("LOG_LEVEL must not be empty");
        }
        Ok(())
    }

    /// Parsed [`Self::forward_bind_addr`].
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an IP address.
    pub fn bind_addr(&self) -> Result<IpAddr> {
        self.forward_bind_addr
            .trim()
            .parse()
            .with_context(|| format!("FORWARD_BIND_ADDR is not an IP address: {}", self.forward_bind_addr))
    }

    pub fn sse_heartbeat(&self) -> Duration {
        Duration::from_secs(self.sse_heartbeat_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
