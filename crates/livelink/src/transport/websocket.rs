//! JSON-over-WebSocket transport.
//!
//! Frames are JSON envelopes `{"type": kind, "data": payload, "timestamp": ts}`.
//! `room_info` envelopes carry room metadata, `close`/`stream_end` envelopes
//! end the connection; everything else is a domain message.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Transport, TransportConnection, TransportSignal};
use crate::anchor::parse_timestamp;
use crate::classifier::{RawError, error_chain};
use crate::config::TransportConfig;
use crate::error::{LinkError, Result};
use crate::event::RawMessage;
use crate::http::install_rustls_provider;
use crate::resolver::ResolvedSession;

/// Placeholder replaced by the URL-encoded room identifier.
pub const ROOM_ID_PLACEHOLDER: &str = "{room_id}";

const SIGNAL_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<Value>,
}

/// Decode one text frame. Control envelopes that need no action yield `None`.
pub(crate) fn decode_frame(text: &str) -> Option<TransportSignal> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Ignoring undecodable frame");
            return None;
        }
    };

    match envelope.kind.as_str() {
        "room_info" | "roomInfo" => Some(TransportSignal::Metadata(envelope.data)),
        "close" | "stream_end" | "streamEnd" => {
            let reason = envelope
                .data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            Some(TransportSignal::Closed(Some(RawError::new(format!(
                "connection closed by upstream: {}",
                reason
            )))))
        }
        "ping" | "pong" | "heartbeat" | "heartbeat_ack" => None,
        _ => {
            let mut message = RawMessage::new(envelope.kind, envelope.data);
            if let Some(ts) = envelope.timestamp.as_ref().and_then(parse_timestamp) {
                message = message.with_timestamp(ts);
            }
            Some(TransportSignal::Message(message))
        }
    }
}

/// Map a WebSocket error to a raw error, keeping HTTP status and timeouts.
pub fn raw_from_ws_error(err: &tokio_tungstenite::tungstenite::Error) -> RawError {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match err {
        WsError::Http(response) => {
            let status = response.status();
            let raw = RawError::http_status(
                status.as_u16(),
                format!(
                    "websocket upgrade rejected: {}",
                    status.canonical_reason().unwrap_or("unexpected status")
                ),
            );
            match response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
            {
                Some(secs) => raw.with_retry_after(Duration::from_secs(secs)),
                None => raw,
            }
        }
        WsError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            RawError::timeout(error_chain(io))
        }
        other => RawError::new(error_chain(other)),
    }
}

/// WebSocket transport configured from [`TransportConfig`].
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url_template: String,
    headers: Vec<(String, String)>,
    heartbeat_text: Option<String>,
    heartbeat_interval: Duration,
}

impl WebSocketTransport {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            headers: Vec::new(),
            heartbeat_text: None,
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let url_template = config
            .url_template
            .clone()
            .ok_or_else(|| LinkError::config("transport.url_template is not set"))?;
        if !url_template.contains(ROOM_ID_PLACEHOLDER) {
            return Err(LinkError::config(format!(
                "transport.url_template must contain {}",
                ROOM_ID_PLACEHOLDER
            )));
        }
        let mut transport = Self::new(url_template);
        transport.headers = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        transport.heartbeat_text = config.heartbeat_text.clone();
        transport.heartbeat_interval = config.heartbeat_interval();
        Ok(transport)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_heartbeat(mut self, text: impl Into<String>, interval: Duration) -> Self {
        self.heartbeat_text = Some(text.into());
        self.heartbeat_interval = interval;
        self
    }

    pub fn url_for(&self, room_id: &str) -> String {
        self.url_template
            .replace(ROOM_ID_PLACEHOLDER, &urlencoding::encode(room_id))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(
        &self,
        session: &ResolvedSession,
    ) -> std::result::Result<TransportConnection, RawError> {
        install_rustls_provider();

        let url = self.url_for(&session.identifier);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| raw_from_ws_error(&e))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RawError::new(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RawError::new(format!("invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        info!(room_id = %session.identifier, url = %url, "Connecting to WebSocket");
        let (mut stream, _) = connect_async(request)
            .await
            .map_err(|e| raw_from_ws_error(&e))?;

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        let heartbeat_text = self.heartbeat_text.clone();
        let heartbeat_interval = self.heartbeat_interval;
        let room_id = session.identifier.clone();

        tokio::spawn(async move {
            let heartbeat_enabled = heartbeat_text.is_some() && !heartbeat_interval.is_zero();
            let mut heartbeat_timer =
                tokio::time::interval(heartbeat_interval.max(Duration::from_millis(1)));
            heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let closed = loop {
                tokio::select! {
                    biased;

                    _ = task_shutdown.cancelled() => {
                        let _ = stream.close(None).await;
                        debug!(room_id = %room_id, "WebSocket task stopped");
                        return;
                    }

                    _ = heartbeat_timer.tick(), if heartbeat_enabled => {
                        if let Some(text) = heartbeat_text.as_deref()
                            && let Err(e) = stream.send(Message::text(text.to_string())).await
                        {
                            warn!(room_id = %room_id, error = %e, "Failed to send heartbeat");
                            break Some(raw_from_ws_error(&e));
                        }
                        trace!(room_id = %room_id, "Sent heartbeat");
                    }

                    frame = stream.next() => {
                        let signal = match frame {
                            Some(Ok(Message::Text(text))) => decode_frame(text.as_str()),
                            Some(Ok(Message::Binary(data))) => {
                                std::str::from_utf8(&data).ok().and_then(decode_frame)
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let detail = frame
                                    .map(|f| format!(" (code {}: {})", u16::from(f.code), f.reason.as_str()))
                                    .unwrap_or_default();
                                break Some(RawError::new(format!(
                                    "connection closed by upstream{}",
                                    detail
                                )));
                            }
                            Some(Ok(_)) => None,
                            Some(Err(e)) => break Some(raw_from_ws_error(&e)),
                            None => break None,
                        };

                        if let Some(signal) = signal {
                            let terminal = matches!(signal, TransportSignal::Closed(_));
                            if signal_tx.send(signal).await.is_err() {
                                // Receiver dropped: nobody is listening any more.
                                let _ = stream.close(None).await;
                                return;
                            }
                            if terminal {
                                let _ = stream.close(None).await;
                                return;
                            }
                        }
                    }
                }
            };

            if let Some(raw) = &closed {
                warn!(room_id = %room_id, error = %raw, "WebSocket connection lost");
            }
            let _ = signal_tx.send(TransportSignal::Closed(closed)).await;
        });

        Ok(TransportConnection::new(Value::Null, signal_rx, shutdown))
    }
}
