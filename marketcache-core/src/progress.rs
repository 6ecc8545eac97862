//! Progress reporting for batch refreshes.
//!
//! Sinks must be `Send + Sync`. An `mpsc::Sender` is the usual sink when a UI
//! thread consumes progress.

use serde::Serialize;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Classifying,
    Cache,
    Provider,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Classifying => "classifying",
            Phase::Cache => "cache",
            Phase::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub instrument: String,
    pub phase: Phase,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Discards every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Prints one line per event.
pub struct StdoutProgress;

impl ProgressSink for StdoutProgress {
    fn report(&self, event: ProgressEvent) {
        println!(
            "[{}/{}] {} ({})",
            event.completed,
            event.total,
            event.instrument,
            event.phase.as_str()
        );
    }
}

/// A channel sender is a sink. A dropped receiver silently discards events.
impl ProgressSink for Sender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn channel_sink_forwards_events() {
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        tx.report(ProgressEvent {
            completed: 1,
            total: 2,
            instrument: "SPY".into(),
            phase: Phase::Cache,
        });
        let event = rx.recv().unwrap();
        assert_eq!(event.instrument, "SPY");
        assert_eq!(event.phase.as_str(), "cache");
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        drop(rx);
        tx.report(ProgressEvent {
            completed: 0,
            total: 0,
            instrument: String::new(),
            phase: Phase::Classifying,
        });
    }
}
