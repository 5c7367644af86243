//! Monitoring Module
//!
//! Step event streaming and execution timelines.
//!
//! # Components
//!
//! - [`EventSink`]: Receives every step state transition
//! - [`ExecutionTimeline`]: Per-step timing and Gantt charts from a run's events

pub mod events;
pub mod timeline;

pub use events::{BroadcastEventSink, EventSink, LogEventSink, NullEventSink, StepEvent};
pub use timeline::{ExecutionTimeline, StepSpan};
