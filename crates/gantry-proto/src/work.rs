//! Work item, response and bridge message types.

use std::time::Duration;

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::{now_millis, RequestId};

/// Body of the synthetic response returned when a worker is not READY.
pub const UNAVAILABLE_BODY: &str =
    "A request was handed to a worker process that is currently unavailable.";

/// Body of the synthetic response returned when a worker dies or times out mid-request.
pub const PROCESSING_ERROR_BODY: &str = "An error was thrown during processing.";

/// Body of the synthetic response returned when no response arrives in time.
pub const UNABLE_TO_PROCESS_BODY: &str = "Unable to process request.";

/// A unit of inbound work.
///
/// Created by the gateway, carried by the broker, and handed to exactly one
/// worker process.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Correlation identifier echoed by the response.
    pub request_id: RequestId,

    /// HTTP method of the originating request.
    pub method: String,

    /// Request path, forwarded verbatim.
    pub path: String,

    /// Request headers in arrival order.
    pub headers: Vec<(String, String)>,

    /// Decoded query parameters in arrival order.
    pub query: Vec<(String, String)>,

    /// Raw request body.
    pub body: Vec<u8>,

    /// When the gateway enqueued the item (ms since epoch).
    pub enqueued_at_ms: u64,

    /// After this instant the item is no longer worth executing (ms since epoch).
    pub expires_at_ms: u64,

    /// Channel the response must be published to.
    pub callback_channel: String,
}

impl WorkItem {
    /// Starts building a work item.
    #[must_use]
    pub fn builder(request_id: RequestId, callback_channel: impl Into<String>) -> WorkItemBuilder {
        WorkItemBuilder::new(request_id, callback_channel.into())
    }

    /// Gets a header value by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the body as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Checks whether the item expired before `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }
}

/// Builder for [`WorkItem`].
#[derive(Debug)]
pub struct WorkItemBuilder {
    item: WorkItem,
    ttl: Duration,
}

impl WorkItemBuilder {
    /// Default lifetime of an item on the queue.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    fn new(request_id: RequestId, callback_channel: String) -> Self {
        Self {
            item: WorkItem {
                request_id,
                method: "GET".to_owned(),
                path: "/".to_owned(),
                headers: Vec::new(),
                query: Vec::new(),
                body: Vec::new(),
                enqueued_at_ms: 0,
                expires_at_ms: 0,
                callback_channel,
            },
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.item.method = method.into();
        self
    }

    /// Sets the request path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.item.path = path.into();
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.item.headers.push((name.into(), value.into()));
        self
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.item.query.push((name.into(), value.into()));
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.item.body = body.into();
        self
    }

    /// Sets how long the item stays worth executing.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Stamps the enqueue and expiry times and returns the item.
    #[must_use]
    pub fn build(mut self) -> WorkItem {
        let now = now_millis();
        self.item.enqueued_at_ms = now;
        self.item.expires_at_ms = now.saturating_add(self.ttl.as_millis() as u64);
        self.item
    }
}

/// The response to a [`WorkItem`].
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkResponse {
    /// Identifier of the originating work item.
    pub request_id: RequestId,

    /// HTTP status code.
    pub status_code: u16,

    /// Response headers.
    pub headers: Vec<(String, String)>,

    /// Response body. Base64 text when `is_base64` is set.
    pub body: String,

    /// Whether `body` is base64-encoded binary.
    pub is_base64: bool,
}

impl WorkResponse {
    /// The default response a handler starts from: 200, no headers, empty body.
    #[must_use]
    pub fn scaffold(request_id: RequestId) -> Self {
        Self::with_status(request_id, 200, String::new())
    }

    /// Synthetic 500 for a dispatch to a worker that is not READY.
    #[must_use]
    pub fn unavailable(request_id: RequestId) -> Self {
        Self::with_status(request_id, 500, UNAVAILABLE_BODY)
    }

    /// Synthetic 500 for a worker that died or timed out with the request in flight.
    #[must_use]
    pub fn processing_error(request_id: RequestId) -> Self {
        Self::with_status(request_id, 500, PROCESSING_ERROR_BODY)
    }

    /// Synthetic 503 for a request whose response never arrived.
    #[must_use]
    pub fn unable_to_process(request_id: RequestId) -> Self {
        Self::with_status(request_id, 503, UNABLE_TO_PROCESS_BODY)
    }

    /// Creates a plain-text response with the given status.
    #[must_use]
    pub fn with_status(request_id: RequestId, status_code: u16, body: impl Into<String>) -> Self {
        Self {
            request_id,
            status_code,
            headers: Vec::new(),
            body: body.into(),
            is_base64: false,
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Gets a header value by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Severity of a handler log record.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One log line produced by a handler during a single invocation.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub message: String,
    pub severity: Severity,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn now(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
            timestamp_ms: now_millis(),
        }
    }
}

/// Messages exchanged over the supervisor ⇄ worker socket.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    /// Supervisor → worker: run the handler for this item.
    Invoke(WorkItem),

    /// Worker → supervisor: the outcome of one invocation.
    Response(BridgeResponse),
}

/// The outcome of one handler invocation.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BridgeResponse {
    /// Log records captured during this invocation only.
    pub logs: Vec<LogRecord>,

    /// The normalised handler response.
    pub callback_data: WorkResponse,
}
