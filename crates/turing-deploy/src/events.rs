//! Progress event channel.
//!
//! One writer (the orchestrator) and one reader (whoever surfaces progress).
//! Delivery is at-most-once and best effort: `write` never waits, and an
//! event is dropped when the queue is full, the writer has been closed, or
//! the reader has gone away.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;
use turing_state::{EventStage, EventType};

/// One step of a deploy or undeploy, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub event_type: EventType,
    pub stage: EventStage,
    pub message: String,
}

impl ProgressEvent {
    pub fn info(stage: EventStage, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Info,
            stage,
            message: message.into(),
        }
    }

    pub fn error(stage: EventStage, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Error,
            stage,
            message: message.into(),
        }
    }
}

/// Create a channel holding at most `capacity` undelivered events.
pub fn event_channel(capacity: usize) -> (EventWriter, EventReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventWriter {
            tx: Some(tx),
            dropped: dropped.clone(),
        },
        EventReader { rx, dropped },
    )
}

/// Sending half. Never blocks.
#[derive(Debug)]
pub struct EventWriter {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventWriter {
    /// Queue an event, or drop it if it cannot be queued right now.
    pub fn write(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if let Err(e) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "reader gone",
            };
            warn!(reason, "progress event dropped");
        }
    }

    pub fn info(&self, stage: EventStage, message: impl Into<String>) {
        self.write(ProgressEvent::info(stage, message));
    }

    pub fn error(&self, stage: EventStage, message: impl Into<String>) {
        self.write(ProgressEvent::error(stage, message));
    }

    /// Stop accepting events. The reader still receives what was queued.
    /// Later writes are dropped.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct EventReader {
    rx: mpsc::Receiver<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventReader {
    /// Wait for the next event. `None` means the writer is closed and the
    /// queue is drained.
    pub async fn read(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Take every event queued right now without waiting.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Number of events the writer could not deliver.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
