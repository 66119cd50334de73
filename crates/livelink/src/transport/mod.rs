//! Transport port.
//!
//! The wire protocol itself is supplied by a [`Transport`] implementation;
//! the session layer only sees a handshake result and a stream of signals.

pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::classifier::RawError;
use crate::event::RawMessage;
use crate::resolver::ResolvedSession;

pub use websocket::WebSocketTransport;

/// What a live connection reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Message(RawMessage),
    /// Room information pushed by the upstream after the handshake.
    Metadata(Value),
    /// The connection ended. `None` means the upstream closed it cleanly.
    Closed(Option<RawError>),
}

/// An established connection.
///
/// Dropping it stops the underlying connection task.
#[derive(Debug)]
pub struct TransportConnection {
    /// Room information returned by the handshake; `Null` when none.
    pub metadata: Value,
    pub signals: mpsc::Receiver<TransportSignal>,
    shutdown: CancellationToken,
}

impl TransportConnection {
    pub fn new(
        metadata: Value,
        signals: mpsc::Receiver<TransportSignal>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            metadata,
            signals,
            shutdown,
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connects to a resolved room.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the handshake. Failures are reported raw and classified by
    /// the caller.
    async fn connect(
        &self,
        session: &ResolvedSession,
    ) -> std::result::Result<TransportConnection, RawError>;
}
