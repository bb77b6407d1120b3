//! Evaluation event export.
//!
//! Single-flag evaluations are buffered in memory by [`ExportService`] and periodically handed
//! to an [`Exporter`] in batches.
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{cache::FlagState, Result};

mod file;

pub use file::{FileExporter, ReportFormat};

/// One flag evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub creation_date: DateTime<Utc>,
    pub key: String,
    pub value: Option<serde_json::Value>,
    pub variant: Option<String>,
    pub reason: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl Event {
    pub fn from_state(state: &FlagState) -> Event {
        Event {
            creation_date: Utc::now(),
            key: state.key.clone(),
            value: state.value.clone(),
            variant: state.variant.clone(),
            reason: state.reason.map(|reason| reason.as_str().to_owned()),
            error_code: state.error_code.clone(),
            error_message: state.error_message.clone(),
        }
    }
}

/// Exported shape of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unix timestamp in seconds.
    pub creation_date: i64,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&Event> for Record {
    fn from(event: &Event) -> Record {
        Record {
            creation_date: event.creation_date.timestamp(),
            key: event.key.clone(),
            value: event.value.clone(),
            variant: event.variant.clone(),
            reason: event.reason.clone(),
            error_code: event.error_code.clone(),
            error_message: event.error_message.clone(),
        }
    }
}

/// A sink for batches of evaluation records.
pub trait Exporter {
    fn export(&self, records: &[Record]) -> Result<()>;
}

impl<T: Fn(&[Record]) -> Result<()>> Exporter for T {
    fn export(&self, records: &[Record]) -> Result<()> {
        self(records)
    }
}

/// Buffers evaluation events and exports them in batches.
///
/// Delivery is at-least-once: a failed export keeps the buffer so the next flush retries it.
pub struct ExportService {
    exporter: Box<dyn Exporter + Send + Sync>,
    max_events: usize,
    events: Mutex<Vec<Event>>,
}

impl ExportService {
    pub fn new(exporter: Box<dyn Exporter + Send + Sync>, max_events: usize) -> ExportService {
        ExportService {
            exporter,
            max_events: max_events.max(1),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Queue an event. Flushes first when the buffer is full.
    ///
    /// The event is queued even if that flush fails.
    pub fn add(&self, event: Event) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.max_events {
            self.flush_locked(&mut events);
        }
        events.push(event);
    }

    /// Export every buffered event. The buffer is cleared only if the export succeeded.
    pub fn flush(&self) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush_locked(&mut events);
    }

    /// Final flush.
    pub fn close(&self) {
        self.flush();
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush_locked(&self, events: &mut Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let records: Vec<Record> = events.iter().map(Record::from).collect();
        match self.exporter.export(&records) {
            Ok(()) => {
                log::debug!(target: "flagserve", "exported {} evaluation events", records.len());
                events.clear();
            }
            Err(err) => {
                log::warn!(target: "flagserve", "failed to export evaluation events: {}", err);
            }
        }
    }
}
