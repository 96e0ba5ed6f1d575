//! Append-only record of processed events, and deterministic replay.
//!
//! The machine appends every externally submitted event that actually
//! fired a transition, in processing order. Replaying the record against a
//! freshly built, unstarted machine with the same tree and the same guard
//! and extractor behavior reaches an equivalent active configuration.
//! Persistence formats stay outside the engine; the serializable
//! [`EventLogSummary`] is what hosts typically write out.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::event::EventContext;
use crate::error::MachineError;
use crate::machine::{MachineStatus, StateMachine};

/// One processed event with its submission context and timestamp.
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    context: EventContext,
    timestamp: DateTime<Utc>,
}

impl RecordedEvent {
    pub fn context(&self) -> &EventContext {
        &self.context
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Ordered record of processed events.
pub(crate) struct EventRecord {
    entries: Vec<RecordedEvent>,
}

impl EventRecord {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn append(&mut self, context: EventContext) {
        self.entries.push(RecordedEvent {
            context,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn entries(&self) -> &[RecordedEvent] {
        &self.entries
    }
}

/// Serializable description of one recorded event.
#[derive(Clone, Debug, Serialize)]
pub struct RecordedEventSummary {
    /// Debug rendering of the event.
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

/// Serializable view of a machine's processed-event record.
#[derive(Clone, Debug, Serialize)]
pub struct EventLogSummary {
    pub entries: Vec<RecordedEventSummary>,
}

impl EventLogSummary {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Summarize a machine's processed-event record for persistence or
/// inspection.
pub fn summarize_record(machine: &StateMachine) -> EventLogSummary {
    let entries = machine
        .recorded_events()
        .into_iter()
        .map(|entry| RecordedEventSummary {
            event: format!("{:?}", entry.context().event()),
            timestamp: entry.timestamp(),
        })
        .collect();
    EventLogSummary { entries }
}

/// Replay recorded events against a freshly built, unstarted machine.
///
/// The machine is started and then fed each event in order. Events that
/// resolve to nothing during replay are skipped, matching how an ignored
/// event leaves the original machine unchanged.
pub fn restore_from_recorded_events(
    machine: &StateMachine,
    events: &[RecordedEvent],
) -> Result<(), MachineError> {
    match machine.status() {
        MachineStatus::Destroyed => return Err(MachineError::Destroyed),
        MachineStatus::NotStarted => {}
        MachineStatus::Running | MachineStatus::Stopped => {
            return Err(MachineError::MutationAfterStart)
        }
    }
    machine.start()?;
    for event in events {
        machine.submit(event.context().clone(), false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TickEvent;
    impl crate::core::event::Event for TickEvent {}

    #[test]
    fn record_preserves_order() {
        let mut record = EventRecord::new();
        record.append(EventContext::new(TickEvent));
        record.append(EventContext::new(TickEvent));
        assert_eq!(record.entries().len(), 2);
        assert!(record.entries()[0].timestamp() <= record.entries()[1].timestamp());
    }

    #[test]
    fn summary_serializes_to_json() {
        let mut record = EventRecord::new();
        record.append(EventContext::new(TickEvent));
        let summary = EventLogSummary {
            entries: record
                .entries()
                .iter()
                .map(|entry| RecordedEventSummary {
                    event: format!("{:?}", entry.context().event()),
                    timestamp: entry.timestamp(),
                })
                .collect(),
        };
        let json = summary.to_json().unwrap();
        assert!(json.contains("TickEvent"));
    }
}
