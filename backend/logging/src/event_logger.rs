//! Module Lifecycle Logger
//!
//! Typed lifecycle transitions, serialized and emitted under the
//! `module_events` target so they land in the NDJSON file as one record each.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::redact::redact_url;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleEvent {
    Fetched { url: String, attempts: u32 },
    Attributed { url: String },
    Loaded,
    Started,
    Stopped { released: usize },
    Failed { phase: String, error: String },
    Unloaded,
}

#[derive(Debug, Serialize)]
pub struct ModuleEventEntry {
    pub module: String,
    pub timestamp: DateTime<Utc>,
    pub event: ModuleEvent,
}

pub struct LifecycleLogger;

impl LifecycleLogger {
    /// Records a lifecycle transition; URLs are redacted first.
    pub fn log_event(module: &str, event: ModuleEvent) -> ModuleEventEntry {
        let event = match event {
            ModuleEvent::Fetched { url, attempts } => {
                ModuleEvent::Fetched { url: redact_url(&url), attempts }
            }
            ModuleEvent::Attributed { url } => ModuleEvent::Attributed { url: redact_url(&url) },
            other => other,
        };

        let entry = ModuleEventEntry {
            module: module.to_string(),
            timestamp: Utc::now(),
            event,
        };

        info!(target: "module_events", module = %entry.module, event = ?entry.event, "Module lifecycle event");
        entry
    }
}
