//! Copies progress events of one operation into the router's event log.

use tokio::task::JoinHandle;
use tracing::warn;
use turing_deploy::{EventWriter, ProgressEvent, event_channel};
use turing_state::{Event, RouterId, StateStore};

/// Owns the writer handed to the orchestrator and a task reading the other
/// end, so the orchestrator never waits on the event log.
pub(crate) struct EventRecorder {
    writer: EventWriter,
    collector: JoinHandle<Vec<ProgressEvent>>,
}

impl EventRecorder {
    pub(crate) fn open(buffer: usize) -> Self {
        let (writer, mut reader) = event_channel(buffer);
        let collector = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = reader.read().await {
                events.push(event);
            }
            events
        });
        Self { writer, collector }
    }

    pub(crate) fn writer(&self) -> &EventWriter {
        &self.writer
    }

    /// Close the channel and append everything received to the event log.
    pub(crate) async fn finish(mut self, store: &StateStore, router_id: RouterId, version: u32) {
        self.writer.close();
        let events = match self.collector.await {
            Ok(events) => events,
            Err(e) => {
                warn!(router_id, error = %e, "progress event collector failed");
                return;
            }
        };
        for event in events {
            let record = Event {
                id: 0,
                router_id,
                version,
                event_type: event.event_type,
                stage: event.stage,
                message: event.message,
                created_at: 0,
            };
            if let Err(e) = store.append_event(&record) {
                warn!(router_id, version, error = %e, "failed to record deployment event");
            }
        }
    }
}
