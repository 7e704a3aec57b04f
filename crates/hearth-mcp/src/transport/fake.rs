//! In-memory transport for unit tests.
//!
//! Answers requests with a handler closure and records every message on the
//! wire so tests can assert on ordering.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use super::{Connect, Transport};
use crate::context::CallContext;
use crate::error::TransportError;
use crate::events::{Event, EventSink};
use crate::protocol::{Notification, Request, RequestId, Response, RpcError};

type Handler = dyn Fn(&str, Option<&Value>) -> Result<Value, RpcError> + Send + Sync;

/// One message observed on the wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WireEntry {
    pub method: String,
    pub params: Option<Value>,
    /// `None` for notifications.
    pub id: Option<RequestId>,
}

struct Shared {
    handler: Box<Handler>,
    wire: Mutex<Vec<WireEntry>>,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    current: Mutex<Option<Arc<FakeTransport>>>,
    sink: Mutex<Option<EventSink>>,
    hold: Mutex<Option<(String, Arc<Notify>)>>,
    parked: AtomicUsize,
}

/// Connector handing out [`FakeTransport`]s that share one wire log.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    shared: Arc<Shared>,
}

impl FakeConnector {
    pub fn new(handler: impl Fn(&str, Option<&Value>) -> Result<Value, RpcError> + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler: Box::new(handler),
                wire: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
                current: Mutex::new(None),
                sink: Mutex::new(None),
                hold: Mutex::new(None),
                parked: AtomicUsize::new(0),
            }),
        }
    }

    /// A well-behaved server with two tools.
    pub fn standard() -> Self {
        Self::new(standard_server)
    }

    pub fn wire(&self) -> Vec<WireEntry> {
        self.shared.wire.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.wire().into_iter().map(|entry| entry.method).collect()
    }

    pub fn clear_wire(&self) {
        self.shared.wire.lock().clear();
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Simulate the server going away under the current transport.
    pub fn drop_connection(&self) {
        if let Some(transport) = self.shared.current.lock().as_ref() {
            transport.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Park every `method` request until the returned gate is notified. A
    /// released request fails if its transport was dropped meanwhile.
    pub fn hold(&self, method: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.shared.hold.lock() = Some((method.to_string(), Arc::clone(&gate)));
        gate
    }

    /// Requests currently parked by [`hold`](Self::hold).
    pub fn parked(&self) -> usize {
        self.shared.parked.load(Ordering::SeqCst)
    }

    /// Deliver an event as if the server had pushed it.
    pub fn push_event(&self, event_type: &str, data: Value) {
        if let Some(sink) = self.shared.sink.lock().as_ref() {
            sink.push(Event {
                event_type: event_type.to_string(),
                data,
                origin: "fake".to_string(),
                time_fired: chrono::Utc::now(),
            });
        }
    }
}

#[async_trait]
impl Connect for FakeConnector {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn Transport>, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::SpawnFailed(std::io::Error::other("connect refused")));
        }
        let transport = Arc::new(FakeTransport {
            shared: Arc::clone(&self.shared),
            connected: AtomicBool::new(true),
        });
        *self.shared.current.lock() = Some(Arc::clone(&transport));
        *self.shared.sink.lock() = Some(events);
        Ok(transport)
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

pub(crate) struct FakeTransport {
    shared: Arc<Shared>,
    connected: AtomicBool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, ctx: &CallContext, request: Request) -> Result<Response, TransportError> {
        if let Some(done) = ctx.err() {
            return Err(done.into());
        }
        let gate = self
            .shared
            .hold
            .lock()
            .as_ref()
            .filter(|(method, _)| *method == request.method)
            .map(|(_, gate)| Arc::clone(gate));
        if let Some(gate) = gate {
            self.shared.parked.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            self.shared.parked.fetch_sub(1, Ordering::SeqCst);
        }
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.wire.lock().push(WireEntry {
            method: request.method.clone(),
            params: request.params.clone(),
            id: Some(request.id.clone()),
        });
        Ok(match (self.shared.handler)(&request.method, request.params.as_ref()) {
            Ok(result) => Response::success(request.id, result),
            Err(error) => Response::failure(request.id, error),
        })
    }

    async fn notify(&self, ctx: &CallContext, notification: Notification) -> Result<(), TransportError> {
        if let Some(done) = ctx.err() {
            return Err(done.into());
        }
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.wire.lock().push(WireEntry {
            method: notification.method,
            params: notification.params,
            id: None,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub(crate) fn standard_server(method: &str, params: Option<&Value>) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "test-server", "version": "1.0.0"},
            "capabilities": {}
        })),
        "tools/list" => Ok(json!({
            "tools": [
                {
                    "name": "get_state",
                    "description": "Read an entity state",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"entity_id": {"type": "string"}},
                        "required": ["entity_id"]
                    }
                },
                {
                    "name": "call-service",
                    "description": "Call a service",
                    "inputSchema": {"type": "object"}
                }
            ]
        })),
        "tools/call" => {
            let params = params.cloned().unwrap_or(Value::Null);
            match params["name"].as_str() {
                Some("get_state") => {
                    let entity = params["arguments"]["entity_id"].as_str().unwrap_or("unknown");
                    if entity == "missing" {
                        Ok(json!({
                            "content": [{"type": "text", "text": "entity not found"}],
                            "isError": true
                        }))
                    } else {
                        Ok(json!({
                            "content": [{"type": "text", "text": format!("{} is on", entity)}],
                            "isError": false
                        }))
                    }
                }
                Some("call-service") => Ok(json!({
                    "content": [
                        {"type": "text", "text": "Result line 1"},
                        {"type": "image", "data": "aGk=", "mimeType": "image/png"},
                        {"type": "text", "text": "Result line 2"}
                    ]
                })),
                other => Err(RpcError::new(
                    RpcError::INVALID_PARAMS,
                    format!("unknown tool {:?}", other),
                )),
            }
        }
        "ping" | "subscribe_events" => Ok(json!({})),
        _ => Err(RpcError::new(RpcError::METHOD_NOT_FOUND, format!("no method {}", method))),
    }
}
