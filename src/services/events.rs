// Stream Events
// Notification seam for stream start/stop. Device handlers subscribe through an EventSink.

use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use super::session_registry::StopReason;
use crate::models::StreamMode;

pub const STREAM_STARTED_EVENT: &str = "stream_started";
pub const STREAM_STOPPED_EVENT: &str = "stream_stopped";

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

/// Sink that writes every event to the log
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &str, payload: Value) {
        log::info!("[Events] {} {}", event, payload);
    }
}

/// Sink that keeps every event in memory, in emission order
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of recorded events with the given name
    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|(name, _)| name == event).count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &str, payload: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event.to_string(), payload));
        }
    }
}

pub fn emit_event<T: Serialize>(sink: &dyn EventSink, event: &str, payload: &T) {
    if let Ok(value) = serde_json::to_value(payload) {
        sink.emit(event, value);
    }
}

/// Payload of `stream_started` / `stream_stopped`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStateEvent {
    pub device_id: String,
    pub mode: StreamMode,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
}

impl StreamStateEvent {
    pub fn started(device_id: &str, mode: StreamMode) -> Self {
        Self {
            device_id: device_id.to_string(),
            mode,
            active: true,
            reason: None,
        }
    }

    pub fn stopped(device_id: &str, mode: StreamMode, reason: StopReason) -> Self {
        Self {
            device_id: device_id.to_string(),
            mode,
            active: false,
            reason: Some(reason),
        }
    }
}
