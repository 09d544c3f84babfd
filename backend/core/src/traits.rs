use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::FetchError;

/// Retrieves module script text (and repository documents) by URL.
#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Severity of a host notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warn,
    Error,
}

/// Fire-and-forget sink for user-visible notifications (console, toast,
/// desktop or VR overlays). Implementations swallow their own failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotifyLevel, title: &str, message: &str);
}

/// Default notifier: forwards to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NotifyLevel, title: &str, message: &str) {
        match level {
            NotifyLevel::Info => info!(target: "notify", title, "{}", message),
            NotifyLevel::Warn => warn!(target: "notify", title, "{}", message),
            NotifyLevel::Error => error!(target: "notify", title, "{}", message),
        }
    }
}

/// Key/value persistence backend for module settings.
///
/// Keys arrive already namespaced by the caller (`<module-id>.<key>`).
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str, default: Value) -> Value;
    /// Returns `false` when the value could not be persisted.
    fn set(&self, key: &str, value: Value) -> bool;
    fn has(&self, key: &str) -> bool;
    fn delete(&self, key: &str) -> bool;
}

/// Process-local settings backend.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str, default: Value) -> Value {
        match self.values.read() {
            Ok(map) => map.get(key).cloned().unwrap_or(default),
            Err(_) => default,
        }
    }

    fn set(&self, key: &str, value: Value) -> bool {
        match self.values.write() {
            Ok(mut map) => {
                map.insert(key.to_string(), value);
                true
            }
            Err(_) => false,
        }
    }

    fn has(&self, key: &str) -> bool {
        self.values.read().map(|m| m.contains_key(key)).unwrap_or(false)
    }

    fn delete(&self, key: &str) -> bool {
        self.values
            .write()
            .map(|mut m| m.remove(key).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.get("m.volume", json!(5)), json!(5));
        assert!(!store.has("m.volume"));
        assert!(store.set("m.volume", json!(7)));
        assert!(store.has("m.volume"));
        assert_eq!(store.get("m.volume", json!(5)), json!(7));
        assert!(store.delete("m.volume"));
        assert!(!store.delete("m.volume"));
    }
}
