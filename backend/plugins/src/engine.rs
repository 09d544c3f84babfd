//! Script engines and the bootstrap slot.
//!
//! A module script defines itself by writing a [`ModuleDefinition`] into its
//! engine's slot while it is evaluated. The load pipeline reads and clears
//! the slot right after evaluation, holding the execution lock, which is the
//! only way a definition is tied back to the URL it came from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use modhost_core::ModuleMetadata;

use crate::lifecycle::ModuleBehavior;

/// What a script produced: its declared metadata and behavior.
#[derive(Clone)]
pub struct ModuleDefinition {
    pub metadata: ModuleMetadata,
    pub behavior: Arc<dyn ModuleBehavior>,
}

impl std::fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDefinition").field("metadata", &self.metadata).finish_non_exhaustive()
    }
}

/// Holds the most recently defined module until the loader takes it.
#[derive(Clone, Default)]
pub struct BootstrapSlot(Arc<Mutex<Option<ModuleDefinition>>>);

impl BootstrapSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites anything already in the slot.
    pub fn put(&self, definition: ModuleDefinition) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(definition);
    }

    pub fn take(&self) -> Option<ModuleDefinition> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// Evaluates module source in a shared environment.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Evaluate `source`. A well-formed script leaves a definition in
    /// [`ScriptEngine::slot`]; `url` is for diagnostics only.
    async fn execute(&self, url: &str, source: &str) -> Result<()>;

    fn slot(&self) -> &BootstrapSlot;
}

pub type ModuleFactory = Arc<dyn Fn() -> ModuleDefinition + Send + Sync>;

/// Engine for modules compiled into the host.
///
/// The "source" is the name of a registered factory, so a repository can
/// point at built-in modules the same way it points at scripts.
#[derive(Default)]
pub struct NativeEngine {
    factories: RwLock<HashMap<String, ModuleFactory>>,
    slot: BootstrapSlot,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, factory: impl Fn() -> ModuleDefinition + Send + Sync + 'static) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(factory));
    }
}

#[async_trait]
impl ScriptEngine for NativeEngine {
    async fn execute(&self, url: &str, source: &str) -> Result<()> {
        let name = source.trim();
        if name.is_empty() {
            // An empty script defines nothing.
            return Ok(());
        }
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("{url}: no built-in module named '{name}'"))?;
        self.slot.put(factory());
        Ok(())
    }

    fn slot(&self) -> &BootstrapSlot {
        &self.slot
    }
}
