/// Ring-buffered log stream behind the WebSocket feed.
///
/// A `tracing_subscriber` layer captures every event into a bounded ring
/// (new clients get the backlog) and fans it out over a broadcast channel
/// (connected clients get records live). Slow WebSocket clients lag and
/// lose records rather than backpressuring the bot.
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Most recent records kept for late-joining clients.
const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

pub struct LogBuffer {
    ring: Mutex<VecDeque<LogRecord>>,
    tx: broadcast::Sender<LogRecord>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            tx,
            capacity,
        })
    }

    pub fn push(&self, record: LogRecord) {
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record.clone());
        drop(ring);
        let _ = self.tx.send(record);
    }

    /// Snapshot of the retained records, oldest first.
    pub fn backlog(&self) -> Vec<LogRecord> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.tx.subscribe()
    }
}

/// Layer feeding every `tracing` event into a [`LogBuffer`].
pub struct LogBufferLayer {
    buffer: Arc<LogBuffer>,
}

impl LogBufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.buffer.push(LogRecord {
            timestamp: chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            level: event.metadata().level().to_string(),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            timestamp: "2025-01-01 00:00:00".into(),
            level: "INFO".into(),
            message: message.into(),
        }
    }

    #[test]
    fn ring_drops_oldest_beyond_capacity() {
        let buffer = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buffer.push(record(&format!("line {i}")));
        }
        let backlog = buffer.backlog();
        let messages: Vec<_> = backlog.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn subscribers_receive_new_records() {
        let buffer = LogBuffer::with_capacity(10);
        let mut rx = buffer.subscribe();
        buffer.push(record("hello"));
        assert_eq!(rx.try_recv().unwrap().message, "hello");
    }
}
