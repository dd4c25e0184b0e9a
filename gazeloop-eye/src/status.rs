//! Status reporting sinks

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

/// Fire-and-forget destination for pipeline status and errors.
pub trait StatusSink: Send + Sync {
    fn report_status(&self, message: &str);
    fn report_error(&self, message: &str);
}

/// Forwards reports into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn report_status(&self, message: &str) {
        info!(target: "gazeloop::status", "{}", message);
    }

    fn report_error(&self, message: &str) {
        error!(target: "gazeloop::status", "{}", message);
    }
}

/// Discards everything, for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn report_status(&self, _message: &str) {}
    fn report_error(&self, _message: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Status(String),
    Error(String),
}

/// Keeps every report in memory. Clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct MemoryStatusSink {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StatusEvent::Error(msg) => Some(msg.clone()),
                StatusEvent::Status(_) => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StatusEvent::Status(msg) => Some(msg.clone()),
                StatusEvent::Error(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl StatusSink for MemoryStatusSink {
    fn report_status(&self, message: &str) {
        self.events.lock().push(StatusEvent::Status(message.to_string()));
    }

    fn report_error(&self, message: &str) {
        self.events.lock().push(StatusEvent::Error(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_shares_log() {
        let sink = MemoryStatusSink::new();
        let clone = sink.clone();
        clone.report_status("ready");
        clone.report_error("boom");

        assert_eq!(
            sink.events(),
            vec![
                StatusEvent::Status("ready".to_string()),
                StatusEvent::Error("boom".to_string())
            ]
        );
        assert_eq!(sink.errors(), vec!["boom".to_string()]);
        assert_eq!(sink.statuses(), vec!["ready".to_string()]);

        sink.clear();
        assert!(clone.events().is_empty());
    }
}
