//! Remote terminal data types and structures

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Short-lived credential returned by the session-creation endpoint.
///
/// The token authorizes exactly one stream upgrade. The routing identifier,
/// when present, pins the stream to the backend node that created the session.
/// Cookies set by the session-creation response travel with the descriptor so
/// the upgrade can replay them regardless of their `Path` or `Domain`.
#[derive(Clone, Deserialize, PartialEq)]
pub struct SessionDescriptor {
    token: String,
    #[serde(rename = "routeId", alias = "route_id", default)]
    route_id: Option<String>,
    #[serde(skip)]
    cookies: Vec<(String, String)>,
}

impl SessionDescriptor {
    pub fn new(token: impl Into<String>, route_id: Option<String>) -> Self {
        Self {
            token: token.into(),
            route_id,
            cookies: Vec::new(),
        }
    }

    /// Attach captured cookies. A later cookie replaces an earlier one with
    /// the same name.
    pub fn with_cookies<I>(mut self, cookies: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in cookies {
            self.cookies.retain(|(existing, _)| *existing != name);
            self.cookies.push((name, value));
        }
        self
    }

    /// Cookies captured during negotiation, as `(name, value)` pairs
    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    /// Fill in the routing identifier from a response header if the body had none
    pub(crate) fn with_route_fallback(mut self, header_route: Option<String>) -> Self {
        if self.route_id.as_deref().is_none_or(str::is_empty) {
            self.route_id = header_route.filter(|route| !route.is_empty());
        }
        self
    }

    /// Token prefix that is safe to put in logs
    pub fn redacted_token(&self) -> String {
        redact(&self.token)
    }
}

impl fmt::Debug for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescriptor")
            .field("token", &self.redacted_token())
            .field("route_id", &self.route_id)
            .field(
                "cookies",
                &self.cookies.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub(crate) fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}***")
}

/// Credentials attached to every session-creation request
#[derive(Clone, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic {
        username: String,
        token: String,
    },
    Bearer(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Basic { username, .. } => {
                write!(f, "Basic {{ username: {username:?}, token: *** }}")
            }
            Credentials::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

/// Out-of-band control frames sent alongside raw terminal bytes.
///
/// Serialized as `{"type": "...", "data": {...}}` text frames. Never awaited
/// for a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
    Ping { ts: i64 },
}

impl ControlMessage {
    pub fn resize(size: TerminalSize) -> Self {
        ControlMessage::Resize {
            cols: size.cols,
            rows: size.rows,
        }
    }

    /// Ping stamped with the current wall-clock time in milliseconds
    pub fn ping() -> Self {
        ControlMessage::Ping {
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, TerminalError> {
        serde_json::to_string(self)
            .map_err(|e| TerminalError::Protocol(format!("Failed to encode control message: {}", e)))
    }
}

/// Outcome of one framed command execution.
///
/// `output` carries whatever could be extracted even when `error` is set.
#[derive(Debug)]
pub struct ExecResult {
    pub output: String,
    pub error: Option<TerminalError>,
}

impl ExecResult {
    pub fn success(output: String) -> Self {
        Self {
            output,
            error: None,
        }
    }

    pub fn failure(output: String, error: TerminalError) -> Self {
        Self {
            output,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<String, TerminalError> {
        match self.error {
            None => Ok(self.output),
            Some(error) => Err(error),
        }
    }
}

/// Error categories reported to the command-line layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    PermissionDenied,
    Unavailable,
    Timeout,
    Connection,
    Input,
    Configuration,
}

impl ErrorCategory {
    /// Process exit code for this category
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Configuration => 2,
            ErrorCategory::Authentication => 3,
            ErrorCategory::PermissionDenied => 4,
            ErrorCategory::Unavailable => 5,
            ErrorCategory::Connection => 6,
            ErrorCategory::Input => 7,
            ErrorCategory::Timeout => 124,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Authentication => "authentication failed",
            ErrorCategory::PermissionDenied => "permission denied",
            ErrorCategory::Unavailable => "not found / feature unavailable",
            ErrorCategory::Timeout => "command timed out",
            ErrorCategory::Connection => "connection error",
            ErrorCategory::Input => "input error",
            ErrorCategory::Configuration => "configuration error",
        };
        f.write_str(label)
    }
}

/// Error types for remote terminal operations
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Authentication failed: check the username and API token")]
    Authentication,
    #[error("Permission denied: these credentials may not open a terminal on this agent")]
    PermissionDenied,
    #[error(
        "Terminal session unavailable (HTTP {status}); is the remote terminal plugin installed on the server? {body}"
    )]
    FeatureUnavailable { status: u16, body: String },
    #[error("Stream upgrade rejected (HTTP {status}): {body}")]
    UpgradeRejected { status: u16, body: String },
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Local input error: {0}")]
    Input(String),
    #[error("HTTP request error: {0}")]
    Http(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Connection closed")]
    Closed,
}

impl TerminalError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TerminalError::Authentication => ErrorCategory::Authentication,
            TerminalError::PermissionDenied => ErrorCategory::PermissionDenied,
            TerminalError::FeatureUnavailable { .. } => ErrorCategory::Unavailable,
            TerminalError::Timeout(_) => ErrorCategory::Timeout,
            TerminalError::Input(_) => ErrorCategory::Input,
            TerminalError::Config(_) => ErrorCategory::Configuration,
            TerminalError::UpgradeRejected { .. }
            | TerminalError::Connection(_)
            | TerminalError::Http(_)
            | TerminalError::Protocol(_)
            | TerminalError::Closed => ErrorCategory::Connection,
        }
    }
}
