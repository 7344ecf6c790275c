//! Handler contract and response normalisation.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use gantry_proto::{WorkItem, WorkResponse};
use serde_json::{Map, Value};

use crate::context::ExecutionContext;

/// Error returned by a handler. Returning one terminates the worker.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// User code served by a worker.
///
/// One handler instance lives for the whole worker process, so state held in
/// `self` persists across invocations until the supervisor recycles the worker.
/// No state is shared between workers.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serves one work item.
    async fn call(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<Completion, HandlerError>;
}

/// How a handler completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A plain value: becomes the body verbatim, status and headers stay at defaults.
    Raw(String),
    /// Explicit response fields. Unset fields keep their defaults.
    Structured(StructuredResponse),
}

impl Completion {
    /// Completes with an empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Raw(String::new())
    }

    /// Completes with the string form of `value`.
    #[must_use]
    pub fn raw(value: impl Display) -> Self {
        Self::Raw(value.to_string())
    }

    /// Interprets a JSON value the way dynamic handlers return results.
    ///
    /// Objects become [`Completion::Structured`] keeping only `statusCode`,
    /// `headers`, `body` and `isBase64`. Strings are used unquoted, `null` is
    /// an empty body, anything else is its JSON text.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::Structured(StructuredResponse::from_fields(&fields)),
            Value::String(text) => Self::Raw(text),
            Value::Null => Self::empty(),
            other => Self::Raw(other.to_string()),
        }
    }

    /// Copies this completion onto the response scaffold.
    ///
    /// `request_id` is never touched.
    pub(crate) fn apply_to(self, response: &mut WorkResponse) {
        match self {
            Self::Raw(body) => response.body = body,
            Self::Structured(fields) => {
                if let Some(status_code) = fields.status_code {
                    response.status_code = status_code;
                }
                if let Some(headers) = fields.headers {
                    response.headers = headers;
                }
                if let Some(body) = fields.body {
                    response.body = body;
                }
                if let Some(is_base64) = fields.is_base64 {
                    response.is_base64 = is_base64;
                }
            }
        }
    }
}

impl From<StructuredResponse> for Completion {
    fn from(response: StructuredResponse) -> Self {
        Self::Structured(response)
    }
}

/// The response fields a handler is allowed to set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredResponse {
    pub status_code: Option<u16>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Option<String>,
    pub is_base64: Option<bool>,
}

impl StructuredResponse {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Marks `body` as base64-encoded binary.
    #[must_use]
    pub fn base64(mut self, is_base64: bool) -> Self {
        self.is_base64 = Some(is_base64);
        self
    }

    fn from_fields(fields: &Map<String, Value>) -> Self {
        Self {
            status_code: fields
                .get("statusCode")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok()),
            headers: fields.get("headers").and_then(Value::as_object).map(|headers| {
                headers
                    .iter()
                    .map(|(name, value)| (name.clone(), text_of(value)))
                    .collect()
            }),
            body: fields.get("body").map(text_of),
            is_base64: fields.get("isBase64").and_then(Value::as_bool),
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Handlers available to a worker binary, keyed by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.register(name, handler);
        self
    }

    /// Looks up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered handler names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_proto::RequestId;
    use rstest::rstest;
    use serde_json::json;

    fn applied(completion: Completion) -> WorkResponse {
        let mut response = WorkResponse::scaffold(RequestId::from("req"));
        completion.apply_to(&mut response);
        response
    }

    #[rstest]
    #[case(json!("Hello"), "Hello")]
    #[case(json!(42), "42")]
    #[case(json!(true), "true")]
    #[case(json!([1, 2]), "[1,2]")]
    #[case(json!(null), "")]
    fn plain_values_become_the_body(#[case] value: Value, #[case] body: &str) {
        let response = applied(Completion::from_json(value));

        assert_eq!(response.body, body);
        assert_eq!(response.status_code, 200);
        assert!(response.headers.is_empty());
        assert!(!response.is_base64);
    }

    #[test]
    fn structured_output_is_allow_listed() {
        let response = applied(Completion::from_json(json!({
            "statusCode": 503,
            "headers": { "X-CUSTOM-HEADER": "v" },
            "body": "Hello Body",
            "unauthedValue": "private",
            "requestId": "forged",
        })));

        assert_eq!(response.status_code, 503);
        assert_eq!(response.header("X-CUSTOM-HEADER"), Some("v"));
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.body, "Hello Body");
        assert_eq!(response.request_id, RequestId::from("req"));
    }

    #[test]
    fn missing_structured_fields_keep_defaults() {
        let response = applied(StructuredResponse::new().body("only body").into());

        assert_eq!(response.status_code, 200);
        assert!(response.headers.is_empty());
        assert_eq!(response.body, "only body");
    }

    #[test]
    fn out_of_range_status_is_ignored() {
        let response = applied(Completion::from_json(json!({ "statusCode": 70000 })));
        assert_eq!(response.status_code, 200);
    }

    #[test]
    fn non_string_header_values_use_json_text() {
        let response = applied(Completion::from_json(json!({
            "headers": { "X-Count": 3 },
            "isBase64": true,
        })));

        assert_eq!(response.header("x-count"), Some("3"));
        assert!(response.is_base64);
    }

    #[test]
    fn registry_lookup() {
        struct Noop;

        #[async_trait]
        impl Handler for Noop {
            async fn call(&self, _: &WorkItem, _: &ExecutionContext) -> Result<Completion, HandlerError> {
                Ok(Completion::empty())
            }
        }

        let registry = HandlerRegistry::new().with("handler", Noop);
        assert!(registry.get("handler").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), ["handler"]);
    }
}
