//! The capability surface handed to module lifecycle methods.
//!
//! Everything a module acquires through its context that needs undoing is
//! recorded in the module's resource ledger, so `stop` can release it
//! without the module keeping its own bookkeeping.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use modhost_core::{HookError, ModuleAction, Notifier, NotifyLevel, SettingsStore};
use modhost_events::{EventCallback, EventOptions, EventRegistry};
use modhost_hooks::{HookCallback, HookTable, HostFunctions};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::ledger::{Observer, ReleaseReport, Resource, ResourceId, ResourceLedger, release_logged};
use crate::settings::ModuleSettings;

/// Shared runtime services every module context is wired to.
#[derive(Clone)]
pub struct ModuleServices {
    pub hooks: HookTable,
    pub events: EventRegistry,
    pub settings: Arc<dyn SettingsStore>,
    pub notifier: Arc<dyn Notifier>,
    /// Bumped on every module state change.
    pub changes: Arc<watch::Sender<u64>>,
}

impl ModuleServices {
    pub fn new(
        hooks: HookTable,
        events: EventRegistry,
        settings: Arc<dyn SettingsStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self { hooks, events, settings, notifier, changes: Arc::new(changes) }
    }

    pub(crate) fn state_changed(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[derive(Clone)]
pub struct ModuleContext {
    id: String,
    ledger: Arc<Mutex<ResourceLedger>>,
    hooks: HookTable,
    events: EventRegistry,
    settings: ModuleSettings,
    actions: Arc<Mutex<Vec<ModuleAction>>>,
    notifier: Arc<dyn Notifier>,
    /// Set between `start` and the end of `stop`.
    running: Arc<AtomicBool>,
}

impl ModuleContext {
    pub fn new(id: impl Into<String>, services: &ModuleServices) -> Self {
        let id = id.into();
        Self {
            settings: ModuleSettings::new(id.clone(), Arc::clone(&services.settings)),
            id,
            ledger: Arc::default(),
            hooks: services.hooks.clone(),
            events: services.events.clone(),
            actions: Arc::default(),
            notifier: Arc::clone(&services.notifier),
            running: Arc::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ---- resources ----

    pub fn register(&self, resource: Resource) -> ResourceId {
        let id = self.ledger.lock().unwrap_or_else(PoisonError::into_inner).register(resource);
        debug!(module = %self.id, resource = %id, "Registered resource");
        id
    }

    /// Release a single resource before the module stops.
    pub fn release(&self, id: ResourceId) -> bool {
        let resource = self.ledger.lock().unwrap_or_else(PoisonError::into_inner).take(id);
        match resource {
            Some(resource) => {
                release_logged(&self.id, id, resource);
                true
            }
            None => false,
        }
    }

    pub fn resource_count(&self) -> usize {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn release_all(&self) -> ReleaseReport {
        // Detach callbacks never run under the lock.
        let mut pending = self.ledger.lock().unwrap_or_else(PoisonError::into_inner).drain();
        pending.release_all(&self.id)
    }

    /// Run `tick` every `period`, first firing one period from now.
    pub fn every(&self, period: Duration, tick: impl Fn() + Send + Sync + 'static) -> ResourceId {
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick();
            }
        });
        self.register(Resource::Timer(handle))
    }

    /// Run `f` once after `delay`.
    pub fn after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> ResourceId {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        self.register(Resource::Timer(handle))
    }

    /// Spawn a background task that is aborted when the module stops.
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) -> ResourceId {
        self.register(Resource::Timer(tokio::spawn(task)))
    }

    pub fn listen(
        &self,
        target: impl Into<String>,
        event: impl Into<String>,
        detach: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> ResourceId {
        self.register(Resource::Listener { target: target.into(), event: event.into(), detach: Box::new(detach) })
    }

    pub fn observe(&self, observer: impl Observer + 'static) -> ResourceId {
        self.register(Resource::Observer(Box::new(observer)))
    }

    pub fn on_cleanup(&self, f: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> ResourceId {
        self.register(Resource::Unsubscribe(Box::new(f)))
    }

    // ---- hooks ----

    /// Hooks are owned by this module and removed when it stops.
    pub fn hook(&self, path: &str, callback: HookCallback) -> Result<(), HookError> {
        self.hooks.register(path, callback, &self.id)
    }

    pub fn host(&self) -> &Arc<HostFunctions> {
        self.hooks.host()
    }

    /// Call a host function through whatever hooks are installed on it.
    pub fn call(&self, path: &str, args: Vec<Value>) -> Result<Value, HookError> {
        self.hooks.host().call(path, args)
    }

    // ---- events ----

    /// Events registered during `load` outlive restarts. Ones first
    /// registered while running are dropped again when the module stops.
    pub fn register_event(&self, name: &str, options: EventOptions) {
        let added = self.events.register_event(name, options, &self.id);
        if added && self.running.load(Ordering::SeqCst) {
            let events = self.events.clone();
            let (name, owner) = (name.to_string(), self.id.clone());
            self.on_cleanup(move || {
                events.unregister_event(&name, &owner);
                Ok(())
            });
        }
    }

    /// Emit with this module recorded as the emitter.
    pub fn emit(&self, name: &str, payload: Value) -> usize {
        self.events.emit(name, payload, Some(&self.id))
    }

    /// Subscribe for the lifetime of the current start.
    pub fn on(&self, name: &str, callback: EventCallback) -> ResourceId {
        let subscription = self.events.on_for(&self.id, name, callback);
        self.on_cleanup(move || {
            subscription.unsubscribe();
            Ok(())
        })
    }

    pub fn off(&self, name: &str, callback: &EventCallback) -> bool {
        self.events.off(name, callback)
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    // ---- settings, actions, notifications ----

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    pub fn add_action(&self, action: ModuleAction) {
        let mut actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        actions.retain(|a| a.id != action.id);
        actions.push(action);
    }

    pub fn actions(&self) -> Vec<ModuleAction> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn notify(&self, level: NotifyLevel, message: &str) {
        self.notifier.notify(level, &self.id, message);
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("id", &self.id)
            .field("resources", &self.resource_count())
            .finish_non_exhaustive()
    }
}
