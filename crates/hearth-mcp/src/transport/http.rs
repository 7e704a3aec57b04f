//! HTTP transport.
//!
//! Each message is one POST to the configured endpoint and the response body
//! carries the correlated JSON-RPC response. The first `Mcp-Session` header a
//! server sends is echoed on every later request until the transport closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{Connect, PendingTable, Transport};
use crate::context::CallContext;
use crate::error::TransportError;
use crate::events::EventSink;
use crate::protocol::{self, Message, Notification, Request, Response};

/// Session affinity header.
pub const SESSION_HEADER: &str = "Mcp-Session";

/// Largest request body the transport will send.
pub const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

/// Largest response body the transport will read.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// How much of a non-2xx body is kept in the error.
const ERROR_BODY_BYTES: usize = 1024;

/// How much of an abandoned body is read and discarded before the response
/// is dropped.
const DRAIN_BYTES: usize = 1024 * 1024;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector for an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    url: String,
    headers: HashMap<String, String>,
    response_timeout: Duration,
}

impl HttpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Headers sent with every request, e.g. `Authorization`.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Build a transport. No I/O happens until the first request.
    pub fn build(&self) -> Result<HttpTransport, TransportError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TransportError::Http(format!("invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Http(format!("invalid value for header '{}': {}", key, e)))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(HttpTransport {
            client,
            url: self.url.clone(),
            headers,
            session: RwLock::new(None),
            connected: AtomicBool::new(true),
            response_timeout: self.response_timeout,
        })
    }
}

#[async_trait]
impl Connect for HttpConnector {
    async fn connect(&self, _events: EventSink) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(self.build()?))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// HTTP transport for MCP servers.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    session: RwLock<Option<String>>,
    connected: AtomicBool,
    response_timeout: Duration,
}

impl HttpTransport {
    /// The captured session ID, if the server sent one.
    pub fn session(&self) -> Option<String> {
        self.session.read().clone()
    }

    async fn post(&self, body: Vec<u8>) -> Result<reqwest::Response, TransportError> {
        if body.len() > MAX_REQUEST_BYTES {
            return Err(TransportError::RequestTooLarge {
                limit: MAX_REQUEST_BYTES,
            });
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .headers(self.headers.clone())
            .body(body);

        if let Some(session) = self.session() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        self.capture_session(&response);
        Ok(response)
    }

    fn capture_session(&self, response: &reqwest::Response) {
        let Some(value) = response.headers().get(SESSION_HEADER) else {
            return;
        };
        let Ok(value) = value.to_str() else {
            warn!(url = %self.url, "Ignoring non-ASCII session header");
            return;
        };

        let mut session = self.session.write();
        if session.is_none() {
            debug!(url = %self.url, session = %value, "Captured MCP session");
            *session = Some(value.to_string());
        }
    }

    async fn exchange(&self, request: &Request) -> Result<Response, TransportError> {
        let body = serde_json::to_vec(request).map_err(|e| TransportError::Encode(e.to_string()))?;
        let response = self.post(body).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }

        let bytes = read_limited(response, MAX_RESPONSE_BYTES).await?;
        match protocol::decode(&bytes)? {
            Message::Response(response)
                if response.id.as_ref().map(PendingTable::key) == Some(PendingTable::key(&request.id)) =>
            {
                Ok(response)
            }
            Message::Response(response) => Err(TransportError::Decode(format!(
                "response id {:?} does not match request id {}",
                response.id, request.id
            ))),
            _ => Err(TransportError::Decode("expected a JSON-RPC response".to_string())),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, ctx: &CallContext, request: Request) -> Result<Response, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(done) = ctx.err() {
            return Err(done.into());
        }

        debug!(url = %self.url, id = %request.id, method = %request.method, "Sending request");

        tokio::select! {
            result = self.exchange(&request) => result,
            done = ctx.done() => Err(done.into()),
            _ = tokio::time::sleep(self.response_timeout) => {
                Err(TransportError::Timeout(self.response_timeout))
            }
        }
    }

    async fn notify(&self, ctx: &CallContext, notification: Notification) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(done) = ctx.err() {
            return Err(done.into());
        }

        let body = serde_json::to_vec(&notification).map_err(|e| TransportError::Encode(e.to_string()))?;
        debug!(url = %self.url, method = %notification.method, "Sending notification");

        let response = tokio::select! {
            response = self.post(body) => response?,
            done = ctx.done() => return Err(done.into()),
        };

        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => {
                // Drain so the connection can be reused.
                let _ = read_limited(response, MAX_RESPONSE_BYTES).await;
                Ok(())
            }
            status => Err(status_error(status, response).await),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.session.write().take();
            debug!(url = %self.url, "Closed HTTP transport");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Read the whole body, failing once it grows past `limit`.
async fn read_limited(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>, TransportError> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TransportError::Http(e.to_string()))?
    {
        if body.len() + chunk.len() > limit {
            drain(response).await;
            return Err(TransportError::BodyTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

async fn status_error(status: StatusCode, mut response: reqwest::Response) -> TransportError {
    let mut body = Vec::new();
    while body.len() < ERROR_BODY_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(ERROR_BODY_BYTES);
    drain(response).await;

    TransportError::HttpStatus {
        status: status.as_u16(),
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

/// Read and discard the rest of a body, up to [`DRAIN_BYTES`]. Returns the
/// number of bytes discarded.
async fn drain(mut response: reqwest::Response) -> usize {
    let mut drained = 0;
    while drained < DRAIN_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => drained += chunk.len(),
            _ => break,
        }
    }
    drained
}
