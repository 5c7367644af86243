//! Execution Timeline
//!
//! Rebuilds per-step timing from a run's event log for reports and
//! Gantt charts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::events::StepEvent;
use crate::execution::context::StepState;

/// Time span of one step, from its first launch to its final state.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpan {
    pub step_id: String,
    /// Milliseconds from the first event of the run.
    pub start_ms: i64,
    pub end_ms: i64,
    pub attempts: u32,
    pub outcome: StepState,
}

impl StepSpan {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// Timeline of a single run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTimeline {
    spans: Vec<StepSpan>,
    total_ms: i64,
}

impl ExecutionTimeline {
    /// Builds the timeline from a run's events, in log order.
    ///
    /// Steps that never ran (skipped, or cancelled while pending) and steps
    /// with no final state yet are left out.
    pub fn from_events(events: &[StepEvent]) -> Self {
        let origin = match events.first() {
            Some(event) => event.timestamp,
            None => return Self::default(),
        };
        let offset = |ts: DateTime<Utc>| (ts - origin).num_milliseconds();

        let mut started: HashMap<&str, (i64, u32)> = HashMap::new();
        let mut spans = Vec::new();
        let mut total_ms = 0;

        for event in events {
            let at = offset(event.timestamp);
            total_ms = total_ms.max(at);

            if event.to == StepState::Running {
                let entry = started.entry(event.step_id.as_str()).or_insert((at, 0));
                entry.1 = entry.1.max(event.attempt);
                continue;
            }

            // A non-final Failed is later left for Running (retry) or
            // Cancelled (cancelled during backoff).
            let settled = event.to.is_terminal()
                && !(event.to == StepState::Failed && superseded(events, event));
            if !settled {
                continue;
            }
            if let Some((start_ms, attempts)) = started.remove(event.step_id.as_str()) {
                spans.push(StepSpan {
                    step_id: event.step_id.clone(),
                    start_ms,
                    end_ms: at,
                    attempts,
                    outcome: event.to,
                });
            }
        }

        spans.sort_by_key(|span| span.start_ms);
        Self { spans, total_ms }
    }

    pub fn spans(&self) -> &[StepSpan] {
        &self.spans
    }

    /// Milliseconds between the first and last event.
    pub fn total_ms(&self) -> i64 {
        self.total_ms
    }

    /// Returns step durations in milliseconds.
    pub fn durations(&self) -> HashMap<String, i64> {
        self.spans
            .iter()
            .map(|span| (span.step_id.clone(), span.duration_ms()))
            .collect()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Bars are drawn with `#` for succeeded steps, `x` for failed ones and
    /// `-` for cancelled ones.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        if self.spans.is_empty() {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / self.total_ms.max(1) as f64;

        for span in &self.spans {
            let start_pos = (span.start_ms as f64 * scale) as usize;
            let width = (span.duration_ms() as f64 * scale).max(1.0) as usize;
            let fill = match span.outcome {
                StepState::Succeeded => "#",
                StepState::Failed => "x",
                _ => "-",
            };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&fill.repeat(width));

            let retries = if span.attempts > 1 {
                format!(", {} attempts", span.attempts)
            } else {
                String::new()
            };
            output.push_str(&format!(
                "{:12} |{:50}| ({} ms{})\n",
                truncate(&span.step_id, 12),
                bar,
                span.duration_ms(),
                retries
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", self.total_ms));
        output
    }
}

fn superseded(events: &[StepEvent], failed: &StepEvent) -> bool {
    events
        .iter()
        .any(|e| e.seq > failed.seq && e.step_id == failed.step_id && e.from == StepState::Failed)
}

/// Pads or truncates a string to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
