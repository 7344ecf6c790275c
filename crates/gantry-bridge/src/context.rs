//! Per-invocation execution context handed to handlers.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use gantry_proto::{LogRecord, RequestId, Severity};
use parking_lot::Mutex;

/// Context for exactly one handler invocation.
///
/// A fresh context (and therefore an empty log buffer) is created for every
/// work item, so records never leak from one invocation into the next.
///
/// # Example
///
/// ```ignore
/// async fn call(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<Completion, HandlerError> {
///     ctx.log().info(["processing", ctx.request_id().as_str()]);
///     Ok(Completion::raw("done"))
/// }
/// ```
#[derive(Debug)]
pub struct ExecutionContext {
    request_id: RequestId,
    handler: String,
    code_path: PathBuf,
    logger: InvocationLogger,
}

impl ExecutionContext {
    pub(crate) fn new(request_id: RequestId, handler: impl Into<String>, code_path: impl Into<PathBuf>) -> Self {
        Self {
            request_id,
            handler: handler.into(),
            code_path: code_path.into(),
            logger: InvocationLogger::default(),
        }
    }

    /// Identifier of the work item being served.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Name the handler was registered under.
    pub fn handler_name(&self) -> &str {
        &self.handler
    }

    /// Directory holding the handler's code and assets.
    pub fn code_path(&self) -> &Path {
        &self.code_path
    }

    /// Logger whose records are returned with this invocation's response.
    pub fn log(&self) -> &InvocationLogger {
        &self.logger
    }

    pub(crate) fn into_logs(self) -> Vec<LogRecord> {
        self.logger.into_records()
    }
}

/// Collects log records for one invocation.
///
/// Each call joins its arguments with `,` into a single message.
#[derive(Debug, Default)]
pub struct InvocationLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl InvocationLogger {
    pub fn debug<I, T>(&self, args: I)
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.record(Severity::Debug, args);
    }

    pub fn info<I, T>(&self, args: I)
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.record(Severity::Info, args);
    }

    pub fn warn<I, T>(&self, args: I)
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.record(Severity::Warn, args);
    }

    pub fn error<I, T>(&self, args: I)
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.record(Severity::Error, args);
    }

    /// Appends a record at the given severity.
    pub fn record<I, T>(&self, severity: Severity, args: I)
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        let message = args
            .into_iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.records.lock().push(LogRecord::now(severity, message));
    }

    /// Number of records captured so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_records(self) -> Vec<LogRecord> {
        self.records.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_are_joined_with_commas() {
        let ctx = ExecutionContext::new(RequestId::from("r"), "handler", "/tmp");
        ctx.log().info([1, 2, 3]);
        ctx.log().warn(["single"]);

        let logs = ctx.into_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "1,2,3");
        assert_eq!(logs[0].severity, Severity::Info);
        assert_eq!(logs[1].message, "single");
        assert_eq!(logs[1].severity, Severity::Warn);
    }

    #[test]
    fn records_keep_call_order() {
        let ctx = ExecutionContext::new(RequestId::from("r"), "handler", "/tmp");
        ctx.log().debug(["a"]);
        ctx.log().error(["b"]);
        ctx.log().info(["c"]);

        let severities: Vec<_> = ctx.into_logs().into_iter().map(|r| r.severity).collect();
        assert_eq!(severities, [Severity::Debug, Severity::Error, Severity::Info]);
    }

    #[test]
    fn accessors_expose_invocation_details() {
        let ctx = ExecutionContext::new(RequestId::from("req-9"), "handler", "/srv/fn");
        assert_eq!(ctx.request_id().as_str(), "req-9");
        assert_eq!(ctx.handler_name(), "handler");
        assert_eq!(ctx.code_path(), Path::new("/srv/fn"));
        assert!(ctx.log().is_empty());
    }
}
