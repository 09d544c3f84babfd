//! Event Registry
//!
//! Names are global: any module may register, emit, or subscribe to any
//! name. Registering an existing name merges into the existing descriptor and
//! unions the registrant set. Delivery is synchronous and runs with no lock
//! held, so a subscriber may emit again (delivery simply recurses).

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::types::{
    BroadcastEvent, EventCallback, EventDescriptor, EventOptions, MODULE_FIELD, WILDCARD,
};

#[derive(Clone)]
struct Subscriber {
    owner: Option<String>,
    callback: EventCallback,
}

struct EventEntry {
    options: EventOptions,
    registrants: BTreeSet<String>,
    emit_count: u64,
    last_emitted: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, EventEntry>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    wildcard: Vec<Subscriber>,
}

impl Inner {
    fn list_for(&mut self, name: &str) -> &mut Vec<Subscriber> {
        if name == WILDCARD {
            &mut self.wildcard
        } else {
            self.subscribers.entry(name.to_string()).or_default()
        }
    }

    fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers.get(name).map_or(0, Vec::len)
    }
}

fn same_callback(a: &EventCallback, b: &EventCallback) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Clone)]
pub struct EventRegistry {
    inner: Arc<Mutex<Inner>>,
    broadcast: broadcast::Sender<BroadcastEvent>,
}

impl EventRegistry {
    pub fn new(broadcast_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self { inner: Arc::new(Mutex::new(Inner::default())), broadcast: tx }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or merge the descriptor for `name` and record `owner` as a
    /// registrant. Newer non-empty description and field hints win; flags are
    /// OR-ed so one module cannot silence another's broadcast.
    ///
    /// Returns true when `owner` was not already a registrant of `name`.
    pub fn register_event(&self, name: &str, options: EventOptions, owner: &str) -> bool {
        let mut inner = self.lock();
        let added = match inner.events.get_mut(name) {
            Some(entry) => {
                if !options.description.is_empty() {
                    entry.options.description = options.description;
                }
                for field in options.fields {
                    if !entry.options.fields.contains(&field) {
                        entry.options.fields.push(field);
                    }
                }
                entry.options.broadcast |= options.broadcast;
                entry.options.log |= options.log;
                entry.registrants.insert(owner.to_string())
            }
            None => {
                inner.events.insert(
                    name.to_string(),
                    EventEntry {
                        options,
                        registrants: BTreeSet::from([owner.to_string()]),
                        emit_count: 0,
                        last_emitted: None,
                    },
                );
                true
            }
        };
        debug!(event = name, module = owner, "Registered event");
        added
    }

    /// Drop `owner` from the registrants of `name`; the descriptor goes
    /// when nobody registers it any more.
    pub fn unregister_event(&self, name: &str, owner: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.events.get_mut(name) else {
            return false;
        };
        let removed = entry.registrants.remove(owner);
        if entry.registrants.is_empty() {
            inner.events.remove(name);
        }
        removed
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.lock().events.contains_key(name)
    }

    /// Emit `payload` under `name`.
    ///
    /// The emitter id is injected under `_module` (non-object payloads are
    /// wrapped as `{"value": payload}` first). Statistics only change for
    /// registered names; subscribers are notified either way. Returns the
    /// number of subscribers that accepted the event.
    pub fn emit(&self, name: &str, payload: Value, emitter: Option<&str>) -> usize {
        let payload = inject_emitter(payload, emitter);

        let (options, exact, wildcard) = {
            let mut inner = self.lock();
            let options = inner.events.get_mut(name).map(|entry| {
                entry.emit_count += 1;
                entry.last_emitted = Some(Utc::now());
                entry.options.clone()
            });
            let exact = inner.subscribers.get(name).cloned().unwrap_or_default();
            (options, exact, inner.wildcard.clone())
        };

        if let Some(options) = &options {
            if options.log {
                info!(target: "module_events", event = name, emitter = ?emitter, payload = %payload, "Event emitted");
            }
            if options.broadcast {
                // No receivers is not an error.
                let _ = self.broadcast.send(BroadcastEvent {
                    name: name.to_string(),
                    payload: payload.clone(),
                });
            }
        }

        let mut delivered = 0;
        for sub in exact.iter().chain(wildcard.iter()) {
            match (sub.callback)(name, &payload) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    event = name,
                    subscriber = sub.owner.as_deref().unwrap_or("host"),
                    error = %e,
                    "Event subscriber failed"
                ),
            }
        }
        delivered
    }

    /// Subscribe to `name` (or to every event with `"*"`). Subscribing the
    /// same callback twice is a no-op.
    pub fn on(&self, name: &str, callback: EventCallback) -> Subscription {
        self.subscribe(name, callback, None)
    }

    /// Like [`on`](Self::on), but attributed to `owner` so that
    /// [`unregister_module`](Self::unregister_module) drops it.
    pub fn on_for(&self, owner: &str, name: &str, callback: EventCallback) -> Subscription {
        self.subscribe(name, callback, Some(owner.to_string()))
    }

    fn subscribe(&self, name: &str, callback: EventCallback, owner: Option<String>) -> Subscription {
        {
            let mut inner = self.lock();
            let list = inner.list_for(name);
            if !list.iter().any(|s| same_callback(&s.callback, &callback)) {
                list.push(Subscriber { owner, callback: Arc::clone(&callback) });
            }
        }
        Subscription { registry: self.clone(), name: name.to_string(), callback }
    }

    /// Remove `callback` from `name`. Returns whether anything was removed.
    pub fn off(&self, name: &str, callback: &EventCallback) -> bool {
        let mut inner = self.lock();
        let list = inner.list_for(name);
        let before = list.len();
        list.retain(|s| !same_callback(&s.callback, callback));
        let removed = list.len() != before;
        if name != WILDCARD && list.is_empty() {
            inner.subscribers.remove(name);
        }
        removed
    }

    /// Drop `owner` from every registrant set (removing descriptors nobody
    /// registers any more) and remove its subscriptions.
    /// Drop every registration and subscription held by `owner`.
    pub fn unregister_module(&self, owner: &str) {
        self.lock().events.retain(|_, entry| {
            entry.registrants.remove(owner);
            !entry.registrants.is_empty()
        });
        self.unsubscribe_module(owner);
    }

    /// Drop `owner`'s subscriptions but keep the events it registered.
    pub fn unsubscribe_module(&self, owner: &str) {
        let mut inner = self.lock();
        let owned = |s: &Subscriber| s.owner.as_deref() == Some(owner);
        inner.wildcard.retain(|s| !owned(s));
        inner.subscribers.retain(|_, list| {
            list.retain(|s| !owned(s));
            !list.is_empty()
        });
    }

    pub fn event(&self, name: &str) -> Option<EventDescriptor> {
        let inner = self.lock();
        inner.events.get(name).map(|entry| snapshot(&inner, name, entry))
    }

    /// Snapshots of every registered event, sorted by name. Mutating the
    /// returned values has no effect on the registry.
    pub fn events(&self) -> Vec<EventDescriptor> {
        let inner = self.lock();
        let mut out: Vec<EventDescriptor> = inner
            .events
            .iter()
            .map(|(name, entry)| snapshot(&inner, name, entry))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.broadcast.subscribe()
    }

    /// Forget every descriptor and subscriber.
    pub fn reset(&self) {
        *self.lock() = Inner::default();
    }
}

fn snapshot(inner: &Inner, name: &str, entry: &EventEntry) -> EventDescriptor {
    EventDescriptor {
        name: name.to_string(),
        options: entry.options.clone(),
        registrants: entry.registrants.iter().cloned().collect(),
        emit_count: entry.emit_count,
        last_emitted: entry.last_emitted,
        subscribers: inner.subscriber_count(name),
        wildcard_subscribers: inner.wildcard.len(),
    }
}

fn inject_emitter(payload: Value, emitter: Option<&str>) -> Value {
    let Some(emitter) = emitter else {
        return payload;
    };
    let mut map = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => Map::from_iter([("value".to_string(), other)]),
    };
    map.insert(MODULE_FIELD.to_string(), Value::String(emitter.to_string()));
    Value::Object(map)
}

/// Handle returned by [`EventRegistry::on`]. Dropping it does nothing;
/// call [`unsubscribe`](Self::unsubscribe) to detach.
#[derive(Clone)]
pub struct Subscription {
    registry: EventRegistry,
    name: String,
    callback: EventCallback,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unsubscribe(&self) -> bool {
        self.registry.off(&self.name, &self.callback)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("name", &self.name).finish()
    }
}
