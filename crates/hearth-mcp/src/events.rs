//! Server-pushed events and the bounded channel that carries them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default capacity of a client's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// An event emitted by a server after `subscribe_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Where the event came from; the server label when the server omits it.
    pub origin: String,
    /// When the event fired; the receive time when the server omits it.
    pub time_fired: DateTime<Utc>,
}

/// `event` notification params as sent by the server. Missing and null
/// fields are treated alike.
#[derive(Deserialize)]
struct EventParams {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    time_fired: Option<DateTime<Utc>>,
}

impl Event {
    /// Decode the params of an `event` notification.
    pub fn from_params(params: Option<Value>, default_origin: &str) -> Result<Self, serde_json::Error> {
        let params: EventParams = serde_json::from_value(params.unwrap_or(Value::Null))?;
        Ok(Self {
            event_type: params.event_type,
            data: params.data,
            origin: params
                .origin
                .filter(|origin| !origin.is_empty())
                .unwrap_or_else(|| default_origin.to_string()),
            time_fired: params.time_fired.unwrap_or_else(Utc::now),
        })
    }
}

/// Producer half of a client's event channel.
///
/// Pushing never blocks: when the channel is full the new event is dropped
/// and counted.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a sink and its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Hand an event to the consumer, dropping it if the channel is full.
    pub fn push(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event_type = %event.event_type,
                    origin = %event.origin,
                    dropped = total,
                    "Event channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event_type = %event.event_type, "No event consumer, discarding event");
            }
        }
    }

    /// Number of events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
