/// Module registry: live instances by id, in load order.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;

use crate::module::Module;

#[derive(Default)]
struct Entries {
    order: Vec<String>,
    modules: HashMap<String, Arc<Module>>,
    by_url: HashMap<String, String>,
}

pub struct ModuleRegistry {
    entries: RwLock<Entries>,
    changes: Arc<watch::Sender<u64>>,
}

impl ModuleRegistry {
    /// `changes` is the counter modules bump on every state transition.
    pub fn new(changes: Arc<watch::Sender<u64>>) -> Self {
        Self { entries: RwLock::default(), changes }
    }

    /// Insert a module. Fails with the module back if its id is taken.
    pub fn insert(&self, module: Arc<Module>) -> Result<(), Arc<Module>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let id = module.id().to_string();
        if entries.modules.contains_key(&id) {
            return Err(module);
        }
        if let Some(url) = module.url() {
            entries.by_url.insert(url.to_string(), id.clone());
        }
        entries.order.push(id.clone());
        entries.modules.insert(id, module);
        drop(entries);
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).modules.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Module>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).modules.get(id).cloned()
    }

    pub fn by_url(&self, url: &str) -> Option<Arc<Module>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.by_url.get(url).and_then(|id| entries.modules.get(id)).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Module>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let module = entries.modules.remove(id)?;
        entries.order.retain(|o| o != id);
        entries.by_url.retain(|_, v| v != id);
        drop(entries);
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
        Some(module)
    }

    /// All modules in load order.
    pub fn list(&self) -> Vec<Arc<Module>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.order.iter().filter_map(|id| entries.modules.get(id).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_started(&self, id: &str) -> bool {
        self.get(id).is_some_and(|m| m.is_started())
    }

    /// Receiver that wakes on any module state change or registry edit.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::services;
    use crate::lifecycle::NoopBehavior;
    use modhost_core::ModuleMetadata;

    fn module(id: &str, url: &str) -> Arc<Module> {
        let mut meta = ModuleMetadata::new(id);
        meta.attribute(url);
        Arc::new(Module::new(meta, Arc::new(NoopBehavior), &services()))
    }

    #[test]
    fn keeps_load_order_and_rejects_duplicates() {
        let reg = ModuleRegistry::new(services().changes);
        reg.insert(module("b", "https://m.dev/b.lua")).unwrap();
        reg.insert(module("a", "https://m.dev/a.lua")).unwrap();
        assert!(reg.insert(module("a", "https://other.dev/a.lua")).is_err());

        let ids: Vec<_> = reg.list().iter().map(|m| m.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(reg.by_url("https://m.dev/a.lua").map(|m| m.id().to_string()), Some("a".into()));
    }

    #[test]
    fn remove_clears_url_index() {
        let reg = ModuleRegistry::new(services().changes);
        reg.insert(module("a", "https://m.dev/a.lua")).unwrap();
        let rx = reg.subscribe_changes();
        assert!(reg.remove("a").is_some());
        assert!(rx.has_changed().unwrap());
        assert!(reg.by_url("https://m.dev/a.lua").is_none());
        assert!(reg.is_empty());
        assert!(reg.remove("a").is_none());
    }
}
