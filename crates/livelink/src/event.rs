//! Inbound raw messages and outbound session events.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::anchor::StreamAnchor;
use crate::classifier::ErrorClassification;
use crate::manager::ConnectionState;

/// Domain event categories forwarded to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Chat,
    Gift,
    Follow,
    Share,
    Like,
    RoomUser,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Chat => "chat",
            EventKind::Gift => "gift",
            EventKind::Follow => "follow",
            EventKind::Share => "share",
            EventKind::Like => "like",
            EventKind::RoomUser => "room_user",
        }
    }

    /// Map an upstream message type to a kind, accepting common spellings.
    pub fn from_wire(kind: &str) -> Option<Self> {
        let normalized: String = kind
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "chat" | "comment" | "message" => Some(EventKind::Chat),
            "gift" => Some(EventKind::Gift),
            "follow" => Some(EventKind::Follow),
            "share" => Some(EventKind::Share),
            "like" => Some(EventKind::Like),
            "roomuser" | "viewers" | "viewercount" => Some(EventKind::RoomUser),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Upstream message type.
    pub kind: String,
    pub payload: Value,
    /// Upstream event time, when the message carried one.
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A deduplicated, time-tagged domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub payload: Value,
    /// Offset from the stream anchor; `None` while the anchor is unknown.
    pub elapsed_ms: Option<u64>,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
}

/// Everything the session layer tells its consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected {
        session_id: String,
        start_anchor: Option<StreamAnchor>,
    },
    Disconnected {
        reason: String,
        classification: Option<ErrorClassification>,
    },
    Blocked {
        classification: ErrorClassification,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    Domain(NormalizedEvent),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::Disconnected { .. } => "disconnected",
            SessionEvent::Blocked { .. } => "blocked",
            SessionEvent::Reconnecting { .. } => "reconnecting",
            SessionEvent::Domain(event) => event.kind.as_str(),
        }
    }
}

/// Receiving end of a manager's event channel.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<SessionEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Next event; `None` once the manager is dropped.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_inner(self) -> mpsc::Receiver<SessionEvent> {
        self.rx
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
