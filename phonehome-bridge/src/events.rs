//! Diagnostic event broadcast.
//!
//! Every callback the listener accepts, and every wait that expires, is
//! announced as a JSON line to whoever subscribed. Subscribing is optional;
//! with no subscribers nothing is serialized. Embedding harnesses subscribe
//! directly; `phonehomed` forwards the stream to its log at `debug`.

use chrono::Utc;
use phonehome_common::{Callback, CallbackKind, CorrelationToken, TransactionId, preview_payload};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_BUFFER: usize = 256;

pub const CALLBACK_RECEIVED: &str = "callback_received";
pub const CALLBACK_DELIVERED: &str = "callback_delivered";
pub const CALLBACK_DROPPED: &str = "callback_dropped";
pub const WAIT_TIMED_OUT: &str = "wait_timed_out";

/// Log target used by [`EventBus::spawn_log_forwarder`].
pub const EVENT_LOG_TARGET: &str = "phonehome_bridge::events";

/// Why a callback did not reach a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The payload carried no correlation token.
    NoToken,
    /// Nobody was waiting for this token.
    NoWaiter,
}

/// Event payload describing one callback.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackEvent<'a> {
    pub kind: CallbackKind,
    pub token: Option<&'a CorrelationToken>,
    pub transaction_id: &'a TransactionId,
    pub payload_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DropReason>,
}

impl<'a> CallbackEvent<'a> {
    pub fn new(callback: &'a Callback) -> Self {
        Self {
            kind: callback.kind,
            token: callback.token.as_ref(),
            transaction_id: &callback.transaction_id,
            payload_preview: preview_payload(&callback.payload),
            reason: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: DropReason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Broadcast channel for bridge events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// Create a new event bus; the buffer is never smaller than `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Emit a structured event with payload.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to serialize event {}: {}", event, err);
                return;
            }
        };
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let _ = self.sender.send(payload.to_string());
    }

    /// Log every event at `debug` until all senders are dropped.
    pub fn spawn_log_forwarder(&self) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(line) => debug!(target: EVENT_LOG_TARGET, event = %line, "Bridge event"),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event log forwarder fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
