//! Request, response and event types exchanged between components.
//!
//! Everything here is serialised as camelCase JSON over the HTTP API and the
//! server-sent event stream.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Maximum number of log lines retained per forward rule.
pub const MAX_LOG_ENTRIES: usize = 200;

// ---------------------------------------------------------------------------
// Forward rules
// ---------------------------------------------------------------------------

/// Kind of workload a forward targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Service,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pod" => Ok(Self::Pod),
            "service" => Ok(Self::Service),
            _ => Err(ServiceError::BadRequest(
                r#"resourceType must be "pod" or "service""#.into(),
            )),
        }
    }
}

/// Lifecycle status of a forward rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Running,
    Stopped,
    Error,
}

/// Validated parameters of a forward, as accepted by the forward manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSpec {
    pub namespace: String,
    pub resource_type: ResourceKind,
    pub resource_name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Snapshot of one forward rule.
///
/// Instances handed out by the forward manager are copies; mutating them has no
/// effect on the live rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    pub id: String,
    pub namespace: String,
    pub resource_type: ResourceKind,
    pub resource_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub status: ForwardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub logs: VecDeque<String>,
    pub connections: u32,
}

impl ForwardRule {
    /// Build a fresh `running` rule with no logs and no connections.
    pub fn new(id: impl Into<String>, spec: &ForwardSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            namespace: spec.namespace.clone(),
            resource_type: spec.resource_type,
            resource_name: spec.resource_name.clone(),
            local_port: spec.local_port,
            remote_port: spec.remote_port,
            status: ForwardStatus::Running,
            error: None,
            created_at,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            connections: 0,
        }
    }

    /// Append a `[HH:MM:SS] message` line, evicting the oldest line once the
    /// buffer holds [`MAX_LOG_ENTRIES`]. Returns the stored line.
    pub fn append_log(&mut self, at: NaiveTime, message: &str) -> String {
        let entry = format!("[{}] {message}", at.format("%H:%M:%S"));
        while self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(entry.clone());
        entry
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event published by the forward manager and streamed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardEvent {
    /// Full rule list; the first event every new subscriber receives.
    Init { forwards: Vec<ForwardRule> },
    Add { forward: ForwardRule },
    Remove { id: String },
    Update { forward: ForwardRule },
    Log { id: String, message: String },
    Stat { id: String, connections: u32 },
}

impl ForwardEvent {
    /// Id of the rule the event refers to, if it refers to exactly one.
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::Init { .. } => None,
            Self::Add { forward } | Self::Update { forward } => Some(&forward.id),
            Self::Remove { id } | Self::Log { id, .. } | Self::Stat { id, .. } => Some(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Create endpoint
// ---------------------------------------------------------------------------

/// A port as sent by clients: either a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    fn to_port(&self) -> Option<u16> {
        let n = match self {
            PortValue::Number(n) => *n,
            PortValue::Text(s) => s.trim().parse::<i64>().ok()?,
        };
        u16::try_from(n).ok().filter(|p| *p != 0)
    }

    fn is_zero(&self) -> bool {
        match self {
            PortValue::Number(n) => *n == 0,
            PortValue::Text(s) => s.is_empty(),
        }
    }
}

/// Request body for `POST /api/forwards`. Every field is optional on the wire
/// so that missing fields are reported with a 400 rather than a parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateForwardRequest {
    pub namespace: Option<String>,
    pub resource_type: Option<String>,
    pub resource_name: Option<String>,
    pub local_port: Option<PortValue>,
    pub remote_port: Option<PortValue>,
}

impl CreateForwardRequest {
    /// Check shape and ranges, producing a [`ForwardSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::BadRequest`] describing the first problem found.
    pub fn validate(self) -> Result<ForwardSpec, ServiceError> {
        let missing = || ServiceError::BadRequest("Missing required fields".into());

        let namespace = self.namespace.filter(|s| !s.is_empty()).ok_or_else(missing)?;
        let resource_type = self.resource_type.filter(|s| !s.is_empty()).ok_or_else(missing)?;
        let resource_name = self.resource_name.filter(|s| !s.is_empty()).ok_or_else(missing)?;
        let local_port = self.local_port.filter(|p| !p.is_zero()).ok_or_else(missing)?;
        let remote_port = self.remote_port.filter(|p| !p.is_zero()).ok_or_else(missing)?;

        let resource_type: ResourceKind = resource_type.parse()?;
        let local_port = local_port
            .to_port()
            .ok_or_else(|| ServiceError::BadRequest("Invalid localPort".into()))?;
        let remote_port = remote_port
            .to_port()
            .ok_or_else(|| ServiceError::BadRequest("Invalid remotePort".into()))?;

        Ok(ForwardSpec {
            namespace,
            resource_type,
            resource_name,
            local_port,
            remote_port,
        })
    }
}

/// Response body for `DELETE /api/forwards/:id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Cluster browsing
// ---------------------------------------------------------------------------

/// A port exposed by a pod container or a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePort {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A forwardable workload listed by `GET /api/resources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub ports: Vec<ResourcePort>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&ServiceError> for ErrorResponse {
    fn from(e: &ServiceError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests.
    pub status: String,
    /// Number of registered forward rules.
    pub forwards: usize,
    /// Number of rules currently in `running` status.
    pub running: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> ForwardSpec {
        ForwardSpec {
            namespace: "default".into(),
            resource_type: ResourceKind::Pod,
            resource_name: "web-1".into(),
            local_port: 8080,
            remote_port: 80,
        }
    }

    fn request(value: serde_json::Value) -> CreateForwardRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn new_rule_is_running_and_empty() {
        let rule = ForwardRule::new("abc", &spec(), Utc::now());
        assert_eq!(rule.status, ForwardStatus::Running);
        assert!(rule.logs.is_empty());
        assert_eq!(rule.connections, 0);
        assert!(rule.error.is_none());
    }

    #[test]
    fn append_log_formats_timestamp() {
        let mut rule = ForwardRule::new("abc", &spec(), Utc::now());
        let at = NaiveTime::from_hms_opt(9, 5, 7).unwrap();
        let entry = rule.append_log(at, "Listening on 0.0.0.0:8080");
        assert_eq!(entry, "[09:05:07] Listening on 0.0.0.0:8080");
        assert_eq!(rule.logs.back().unwrap(), &entry);
    }

    #[test]
    fn log_buffer_keeps_newest_entries() {
        let mut rule = ForwardRule::new("abc", &spec(), Utc::now());
        let at = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        for i in 0..=MAX_LOG_ENTRIES {
            rule.append_log(at, &format!("line {i}"));
        }
        assert_eq!(rule.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(rule.logs.front().unwrap(), "[00:00:00] line 1");
        assert_eq!(
            rule.logs.back().unwrap(),
            &format!("[00:00:00] line {MAX_LOG_ENTRIES}")
        );
    }

    #[test]
    fn rule_serialises_camel_case_without_empty_error() {
        let rule = ForwardRule::new("abc", &spec(), Utc::now());
        let v = serde_json::to_value(&rule).unwrap();
        assert_eq!(v["resourceType"], "pod");
        assert_eq!(v["localPort"], 8080);
        assert_eq!(v["status"], "running");
        assert!(v.get("error").is_none());
        assert!(v.get("createdAt").is_some());
    }

    #[test]
    fn events_are_tagged_by_type() {
        let v = serde_json::to_value(ForwardEvent::Stat {
            id: "abc".into(),
            connections: 2,
        })
        .unwrap();
        assert_eq!(v, json!({"type": "stat", "id": "abc", "connections": 2}));

        let v = serde_json::to_value(ForwardEvent::Remove { id: "abc".into() }).unwrap();
        assert_eq!(v, json!({"type": "remove", "id": "abc"}));
    }

    #[test]
    fn event_rule_id() {
        let rule = ForwardRule::new("abc", &spec(), Utc::now());
        assert_eq!(ForwardEvent::Add { forward: rule }.rule_id(), Some("abc"));
        assert_eq!(ForwardEvent::Init { forwards: vec![] }.rule_id(), None);
    }

    #[test]
    fn validate_accepts_numbers_and_numeric_strings() {
        let spec = request(json!({
            "namespace": "default",
            "resourceType": "service",
            "resourceName": "api",
            "localPort": "8080",
            "remotePort": 80
        }))
        .validate()
        .unwrap();
        assert_eq!(spec.resource_type, ResourceKind::Service);
        assert_eq!(spec.local_port, 8080);
        assert_eq!(spec.remote_port, 80);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let err = request(json!({"namespace": "default", "resourceType": "pod"}))
            .validate()
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.to_string(), "Missing required fields");
    }

    #[test]
    fn validate_rejects_unknown_resource_type() {
        let err = request(json!({
            "namespace": "default",
            "resourceType": "deployment",
            "resourceName": "api",
            "localPort": 8080,
            "remotePort": 80
        }))
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("resourceType"));
    }

    #[test]
    fn validate_rejects_out_of_range_ports() {
        let err = request(json!({
            "namespace": "default",
            "resourceType": "pod",
            "resourceName": "web-1",
            "localPort": 70000,
            "remotePort": 80
        }))
        .validate()
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid localPort");

        let err = request(json!({
            "namespace": "default",
            "resourceType": "pod",
            "resourceName": "web-1",
            "localPort": 8080,
            "remotePort": "http"
        }))
        .validate()
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid remotePort");
    }
}
