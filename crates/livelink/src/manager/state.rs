//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session has been requested yet.
    #[default]
    Idle,
    /// Mapping the handle to a room identifier.
    Resolving,
    /// Transport handshake in progress.
    Connecting,
    Connected,
    /// Waiting out the backoff before the next connect attempt.
    Reconnecting,
    /// Stopped on a failure that needs someone to act.
    Blocked,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Blocked => "blocked",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "resolving" => Some(Self::Resolving),
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "reconnecting" => Some(Self::Reconnecting),
            "blocked" => Some(Self::Blocked),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }

    /// States from which `connect()` may start a new session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle | Self::Blocked | Self::Disconnected)
    }

    /// Whether a session is being established or is live.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, target) {
            // A new connect() starts from any resting state
            (Idle | Disconnected | Blocked, Resolving) => true,
            (Resolving, Connecting | Blocked | Disconnected) => true,
            (Connecting, Connected | Reconnecting | Blocked | Disconnected) => true,
            // A ban pushed over a live connection is not retried
            (Connected, Reconnecting | Blocked | Disconnected) => true,
            // Reconnects re-resolve (cache first) without leaving Reconnecting
            (Reconnecting, Connecting | Blocked | Disconnected) => true,
            // disconnect() is accepted everywhere
            (_, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
