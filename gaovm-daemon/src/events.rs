//! Daemon-wide event fan-out.
//!
//! Producers (config store, supervisor) emit through an [`EventSink`]
//! closure wired to this bus; each subscribed session holds a broadcast
//! receiver and forwards events as `event` notifications. Delivery is
//! best-effort: the broadcast buffer is bounded and a lagging session drops
//! events rather than blocking the emitter.

use std::sync::Arc;

use tokio::sync::broadcast;

use gaovm_proto::message::{Event, EventSink};
use gaovm_store::{LogLevel, RotatingLogSink};

const EVENT_BUFFER: usize = 256;

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    log: Arc<RotatingLogSink>,
}

impl EventBus {
    #[must_use]
    pub fn new(log: Arc<RotatingLogSink>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self { tx, log })
    }

    /// Log and broadcast one event. Never blocks; with no subscribers the
    /// event is only logged.
    pub fn emit(&self, event: Event) {
        let _ = self.log.append(
            LogLevel::Info,
            &format!("event {} {}", event.kind, event.payload),
        );
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// The emission callback handed to the store and the supervisor.
    #[must_use]
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let bus = Arc::clone(self);
        Arc::new(move |event| bus.emit(event))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bus() -> (Arc<EventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(RotatingLogSink::open(dir.path().join("daemon.log")).expect("sink"));
        (EventBus::new(log), dir)
    }

    #[tokio::test]
    async fn emitted_events_reach_subscribers() {
        let (bus, _dir) = bus();
        let mut rx = bus.subscribe();
        bus.emit(Event::new("driver.exited", json!({"code": 1})));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.kind, "driver.exited");
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block_or_fail() {
        let (bus, dir) = bus();
        bus.emit(Event::new("config.updated", json!({})));
        let content =
            std::fs::read_to_string(dir.path().join("daemon.log")).expect("log readable");
        assert!(content.contains("config.updated"), "event must be logged");
    }

    #[tokio::test]
    async fn sink_routes_through_the_bus() {
        let (bus, _dir) = bus();
        let mut rx = bus.subscribe();
        let sink = bus.sink();
        sink(Event::new("pending_config_written", json!({"fields": ["cpu"]})));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.kind, "pending_config_written");
    }
}
