use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Lifecycle ──────────────────────────────────────────────────

/// Phase of the service supervisor. Exactly one is current at any time.
///
/// Valid flow: `Idle → Starting → (Running | Error)`, any → `Stopped`.
/// `Idle` is never re-entered once left.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Idle,
    Starting,
    /// Backend reachable. `port` is display-only, 0 in remote mode.
    Running { port: u16 },
    /// Terminal for the run until a new start is requested.
    Error { message: String },
    Stopped,
}

impl LifecycleState {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// True while a run is in flight. `start` is a no-op in these states.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Error { .. } => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { port } if *port == 0 => write!(f, "running (remote)"),
            Self::Running { port } => write!(f, "running on port {port}"),
            Self::Error { message } => write!(f, "error: {message}"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// What observers receive: the current state plus when and for which run it was entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    pub since: DateTime<Utc>,
    /// Start attempt that produced this state. `None` before the first start.
    pub run_id: Option<Uuid>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: LifecycleState::Idle,
            since: Utc::now(),
            run_id: None,
        }
    }
}

// ── Connection ─────────────────────────────────────────────────

/// Which backend a run talks to. Derived from the snapshot, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    Embedded,
    Remote,
}

impl ConnectionMode {
    /// Classify a raw mode value. Only `remote` (any case, surrounding
    /// whitespace ignored) selects the remote backend; everything else,
    /// including `local` and unknown values, is `Embedded`.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("remote") {
            Self::Remote
        } else {
            Self::Embedded
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved backend endpoint for API callers. Set once per successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub base_url: String,
    /// Access credential for the `X-API-Key` header. Empty if none was resolved.
    pub credential: String,
    pub remote: bool,
}

impl Connection {
    pub fn remote(base_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credential: credential.into(),
            remote: true,
        }
    }

    pub fn embedded(host: &str, port: u16, credential: impl Into<String>) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            credential: credential.into(),
            remote: false,
        }
    }

    pub fn has_credential(&self) -> bool {
        !self.credential.is_empty()
    }
}
