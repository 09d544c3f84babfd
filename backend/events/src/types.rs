use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscriber name that receives every event.
pub const WILDCARD: &str = "*";

/// Reserved payload field carrying the emitting module's id.
pub const MODULE_FIELD: &str = "_module";

/// Receives `(event name, payload)`. Errors are logged by the registry and
/// never stop delivery to other subscribers.
pub type EventCallback = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Declared metadata for an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventOptions {
    pub description: String,
    /// Payload field hints, for introspection only.
    pub fields: Vec<String>,
    /// Forward emits to the cross-process broadcast channel.
    pub broadcast: bool,
    /// Log every emit.
    pub log: bool,
}

impl EventOptions {
    pub fn described(description: impl Into<String>) -> Self {
        Self { description: description.into(), ..Default::default() }
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    pub fn logged(mut self) -> Self {
        self.log = true;
        self
    }
}

/// Read-only snapshot of a registered event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub options: EventOptions,
    /// Ids of every module that registered this name, sorted.
    pub registrants: Vec<String>,
    pub emit_count: u64,
    pub last_emitted: Option<DateTime<Utc>>,
    pub subscribers: usize,
    pub wildcard_subscribers: usize,
}

/// Message sent on the broadcast channel for events flagged `broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub name: String,
    pub payload: Value,
}
