//! Per-module settings with a declared schema.
//!
//! Keys are namespaced as `<module id>.<key>` in the host store. Writes are
//! validated against the definition and numeric values are clamped into
//! their declared range rather than rejected.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use modhost_core::{SettingsError, SettingsStore};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettingKind {
    Bool,
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Milliseconds.
    Duration {
        #[serde(default)]
        min_ms: Option<u64>,
        #[serde(default)]
        max_ms: Option<u64>,
    },
    Text,
    Select { options: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDefinition {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub kind: SettingKind,
    #[serde(default)]
    pub default: Value,
}

impl SettingDefinition {
    pub fn new(key: impl Into<String>, kind: SettingKind, default: Value) -> Self {
        let key = key.into();
        Self { label: key.clone(), key, description: String::new(), kind, default }
    }

    /// Coerce `value` into something this setting accepts.
    pub fn normalize(&self, value: Value) -> Result<Value, SettingsError> {
        let wrong = |expected| SettingsError::WrongType { key: self.key.clone(), expected };
        match &self.kind {
            SettingKind::Bool => value.is_boolean().then_some(value).ok_or_else(|| wrong("a boolean")),
            SettingKind::Text => value.is_string().then_some(value).ok_or_else(|| wrong("a string")),
            SettingKind::Number { min, max } => {
                let mut n = value.as_f64().ok_or_else(|| wrong("a number"))?;
                if let Some(min) = min {
                    n = n.max(*min);
                }
                if let Some(max) = max {
                    n = n.min(*max);
                }
                Ok(number_value(n))
            }
            SettingKind::Duration { min_ms, max_ms } => {
                // Negative and fractional input clamps like any other number.
                let mut ms = value.as_f64().ok_or_else(|| wrong("milliseconds"))?.round().max(0.0);
                if let Some(min) = min_ms {
                    ms = ms.max(*min as f64);
                }
                if let Some(max) = max_ms {
                    ms = ms.min(*max as f64);
                }
                Ok(json!(ms as u64))
            }
            SettingKind::Select { options } => {
                let choice = value.as_str().ok_or_else(|| wrong("one of the listed options"))?;
                if options.iter().any(|o| o == choice) {
                    Ok(value)
                } else {
                    Err(SettingsError::InvalidOption { key: self.key.clone(), value: choice.to_string() })
                }
            }
        }
    }
}

fn number_value(n: f64) -> Value {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if n.fract() == 0.0 && n.abs() < EXACT {
        json!(n as i64)
    } else {
        json!(n)
    }
}

/// A module's view of the host settings store.
#[derive(Clone)]
pub struct ModuleSettings {
    module: String,
    store: Arc<dyn SettingsStore>,
    definitions: Arc<RwLock<BTreeMap<String, SettingDefinition>>>,
}

impl ModuleSettings {
    pub fn new(module: impl Into<String>, store: Arc<dyn SettingsStore>) -> Self {
        Self { module: module.into(), store, definitions: Arc::default() }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}.{}", self.module, key)
    }

    /// Declare a setting. Redefining a key replaces its definition.
    pub fn define(&self, definition: SettingDefinition) {
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.key.clone(), definition);
    }

    pub fn definition(&self, key: &str) -> Option<SettingDefinition> {
        self.definitions.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn definitions(&self) -> Vec<SettingDefinition> {
        self.definitions.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    /// Stored value, or the declared default. Unknown keys read as null.
    pub fn get(&self, key: &str) -> Value {
        let default = self.definition(key).map(|d| d.default).unwrap_or(Value::Null);
        self.store.get(&self.storage_key(key), default)
    }

    /// Validate, clamp and persist. Returns the value actually stored.
    pub fn set(&self, key: &str, value: Value) -> Result<Value, SettingsError> {
        let definition = self.definition(key).ok_or_else(|| SettingsError::UnknownKey(key.to_string()))?;
        let value = definition.normalize(value)?;
        if self.store.set(&self.storage_key(key), value.clone()) {
            Ok(value)
        } else {
            Err(SettingsError::PersistFailed(self.storage_key(key)))
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.store.has(&self.storage_key(key))
    }

    /// Drop the stored value so reads fall back to the default.
    pub fn reset(&self, key: &str) -> bool {
        self.store.delete(&self.storage_key(key))
    }
}

impl std::fmt::Debug for ModuleSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSettings").field("module", &self.module).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modhost_core::MemorySettingsStore;

    fn settings() -> (ModuleSettings, Arc<MemorySettingsStore>) {
        let store = Arc::new(MemorySettingsStore::new());
        let s = ModuleSettings::new("notes", store.clone());
        s.define(SettingDefinition::new("volume", SettingKind::Number { min: Some(0.0), max: Some(10.0) }, json!(5)));
        s.define(SettingDefinition::new(
            "poll",
            SettingKind::Duration { min_ms: Some(1000), max_ms: None },
            json!(5000),
        ));
        s.define(SettingDefinition::new(
            "theme",
            SettingKind::Select { options: vec!["dark".into(), "light".into()] },
            json!("dark"),
        ));
        (s, store)
    }

    #[test]
    fn defaults_until_written_then_namespaced() {
        let (s, store) = settings();
        assert_eq!(s.get("volume"), json!(5));
        assert!(!s.has("volume"));
        assert_eq!(s.set("volume", json!(7)).unwrap(), json!(7));
        assert!(store.has("notes.volume"));
        assert_eq!(s.get("volume"), json!(7));
        assert!(s.reset("volume"));
        assert_eq!(s.get("volume"), json!(5));
    }

    #[test]
    fn numbers_and_durations_are_clamped() {
        let (s, _) = settings();
        assert_eq!(s.set("volume", json!(42)).unwrap(), json!(10));
        assert_eq!(s.set("volume", json!(-3.5)).unwrap(), json!(0));
        assert_eq!(s.set("volume", json!(2.5)).unwrap(), json!(2.5));
        assert_eq!(s.set("poll", json!(10)).unwrap(), json!(1000));
        assert_eq!(s.set("poll", json!(-250)).unwrap(), json!(1000));
        assert_eq!(s.set("poll", json!(1500.6)).unwrap(), json!(1501));
        assert!(matches!(s.set("poll", json!("soon")), Err(SettingsError::WrongType { .. })));
    }

    #[test]
    fn rejects_bad_writes() {
        let (s, _) = settings();
        assert!(matches!(s.set("volume", json!("loud")), Err(SettingsError::WrongType { .. })));
        assert!(matches!(s.set("theme", json!("neon")), Err(SettingsError::InvalidOption { .. })));
        assert_eq!(s.set("missing", json!(1)), Err(SettingsError::UnknownKey("missing".into())));
        assert_eq!(s.get("missing"), Value::Null);
    }

    #[test]
    fn definition_parses_from_json() {
        let def: SettingDefinition = serde_json::from_value(json!({
            "key": "enabled",
            "kind": { "type": "bool" },
            "default": true
        }))
        .unwrap();
        assert_eq!(def.kind, SettingKind::Bool);
        assert_eq!(def.default, json!(true));
    }
}
