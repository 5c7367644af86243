//! Step Event Stream
//!
//! Every step state transition produces a [`StepEvent`]. The scheduler
//! appends it to the run's event log and hands it to the engine's
//! [`EventSink`], which forwards it to whatever collector is attached.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::execution::context::{RunId, StepState};

/// One step state transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepEvent {
    /// Position in the run's event log, starting at 1.
    pub seq: u64,
    pub run_id: RunId,
    pub step_id: String,
    pub from: StepState,
    pub to: StepState,
    /// Attempt the transition belongs to (0 for steps never launched).
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Destination for step events.
///
/// Called from the scheduler loop, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &StepEvent);
}

/// Writes each event as a JSON line through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &StepEvent) {
        match serde_json::to_string(event) {
            Ok(line) => debug!(target: "conductor::events", "{}", line),
            Err(e) => warn!("Failed to serialize step event: {}", e),
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &StepEvent) {}
}

/// Fans events out to in-process subscribers.
///
/// Slow subscribers lag and lose the oldest events rather than stalling
/// the scheduler.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<StepEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &StepEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event.clone());
    }
}
