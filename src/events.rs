//! Run events broadcast to any number of observers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::scheduler::{ConcurrencyChange, RunSummary};
use crate::state_machine::TaskRecord;

const EVENT_BUFFER: usize = 256;

/// Running totals, emitted after every settled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub successful: u32,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    BatchStarted {
        batch: u32,
        size: usize,
        concurrency: usize,
    },
    TaskSettled(TaskRecord),
    Progress(ProgressEvent),
    ConcurrencyAdjusted(ConcurrencyChange),
    Finished(RunSummary),
}

/// Fan-out of [`RunEvent`]s. Emitting with no subscribers is not an error.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<RunEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();

        emitter.emit(RunEvent::Progress(ProgressEvent {
            successful: 1,
            attempts: 2,
        }));

        match rx.recv().await.unwrap() {
            RunEvent::Progress(p) => assert_eq!(p, ProgressEvent { successful: 1, attempts: 2 }),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let emitter = EventEmitter::new();
        emitter.emit(RunEvent::BatchStarted {
            batch: 1,
            size: 3,
            concurrency: 3,
        });
    }

    #[test]
    fn progress_serializes_with_tag() {
        let event = RunEvent::Progress(ProgressEvent {
            successful: 4,
            attempts: 9,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["successful"], 4);
        assert_eq!(json["attempts"], 9);
    }
}
