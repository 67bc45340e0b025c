//! Per-upstream runtime state.

use chrono::{DateTime, Utc};
use manifold_mcp::protocol::ServerInfo;
use serde::Serialize;

/// Lifecycle state of one upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl UpstreamState {
    pub fn is_ready(&self) -> bool {
        matches!(self, UpstreamState::Ready)
    }

    /// Whether a reconnect attempt may be scheduled from this state.
    pub fn can_retry(&self) -> bool {
        matches!(self, UpstreamState::Disconnected | UpstreamState::Degraded)
    }
}

/// Observable snapshot of one upstream runtime, published over a watch
/// channel for cheap reads.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub name: String,
    pub state: UpstreamState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,

    pub tool_count: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub consecutive_failures: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tools_refresh: Option<DateTime<Utc>>,
}

impl UpstreamStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: UpstreamState::Disconnected,
            server_info: None,
            tool_count: 0,
            last_error: None,
            consecutive_failures: 0,
            connected_at: None,
            last_tools_refresh: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_only_from_disconnected_or_degraded() {
        assert!(UpstreamState::Disconnected.can_retry());
        assert!(UpstreamState::Degraded.can_retry());
        assert!(!UpstreamState::Ready.can_retry());
        assert!(!UpstreamState::Connecting.can_retry());
        assert!(!UpstreamState::Closed.can_retry());
    }
}
