// Common types for App Proxy

use serde::{Deserialize, Serialize};

/// Kind of outbound proxy a configuration points at
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProxyKind {
    /// HTTP CONNECT proxy
    Http,
    /// SOCKS4 proxy (no password support)
    Socks4,
    /// SOCKS5 proxy
    Socks5,
    /// No upstream, relay directly
    Direct,
    /// Drop all traffic
    Reject,
    /// Caller-supplied full URI in the server field
    Raw,
}

impl ProxyKind {
    /// Fields a form should require for this kind. Advisory only: the URI
    /// builder degrades gracefully when any of them is empty.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ProxyKind::Http | ProxyKind::Socks5 => &["server", "port", "user", "pass"],
            ProxyKind::Socks4 => &["server", "port", "user"],
            ProxyKind::Direct | ProxyKind::Reject => &[],
            ProxyKind::Raw => &["server"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Direct => "direct",
            ProxyKind::Reject => "reject",
            ProxyKind::Raw => "raw",
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored proxy configuration record
///
/// `id` is assigned by the store on insert and immutable afterwards.
/// At most one record in the store has `selected = true`; once the store is
/// non-empty, exactly one does. The flag is only ever changed by the store
/// itself (first-insert auto-select, `select`, delete reselection).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::FromRow)]
pub struct ProxyConfig {
    pub id: i64,
    pub name: String,
    pub kind: ProxyKind,
    pub user: String,
    pub pass: String,
    pub server: String,
    /// 0 means "no port", otherwise 1-65535
    pub port: u16,
    pub selected: bool,
}

/// Payload for inserting or updating a configuration
///
/// Deliberately has no `selected` field: selection changes go through the
/// store's `select` operation, never through a record write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfigDraft {
    pub name: String,
    pub kind: ProxyKind,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub port: u16,
}

/// Why a session ended up in the Failed state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The user declined the tunnel permission grant
    PermissionDenied,
    /// The OS refused to allocate a tunnel interface
    InterfaceUnavailable,
    /// The relay engine failed to configure or start
    EngineStart { message: String },
}

/// State of the proxy session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Stopped,  // no tunnel, idle
    Starting, // permission / interface / engine bring-up in progress
    Running,  // engine relaying traffic
    Stopping, // tearing down
    Failed { reason: FailureReason }, // terminal until the next start
}

impl SessionState {
    /// Check if the tunnel is up
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// Check if a transition is in progress
    pub fn is_in_progress(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Stopping)
    }
}
