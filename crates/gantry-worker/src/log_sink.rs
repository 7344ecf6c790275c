//! Destinations for handler log records drained from bridge responses.

use gantry_proto::{LogRecord, Severity};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::state::WorkerId;

pub trait LogSink: Send + Sync {
    fn write(&self, worker_id: WorkerId, record: &LogRecord);
}

/// Re-emits handler records as tracing events at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, worker_id: WorkerId, record: &LogRecord) {
        let ts = record.timestamp_ms;
        let message = &record.message;
        match record.severity {
            Severity::Debug => debug!(worker_id = %worker_id, ts, "{message}"),
            Severity::Info => info!(worker_id = %worker_id, ts, "{message}"),
            Severity::Warn => warn!(worker_id = %worker_id, ts, "{message}"),
            Severity::Error => error!(worker_id = %worker_id, ts, "{message}"),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of the records written so far, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Removes and returns the records written so far.
    pub fn take(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl LogSink for MemoryLogSink {
    fn write(&self, _worker_id: WorkerId, record: &LogRecord) {
        self.records.lock().push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemoryLogSink::new();
        let id = WorkerId::generate();
        sink.write(id, &LogRecord::now(Severity::Warn, "first"));
        sink.write(id, &LogRecord::now(Severity::Info, "second"));

        let messages: Vec<_> = sink.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, ["first", "second"]);

        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }
}
