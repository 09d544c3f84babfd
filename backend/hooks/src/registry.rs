/// Hook table: path → per-kind callback chains.
///
/// The first registration on a path captures the original host function and
/// installs a dispatcher in its place. Later registrations append to the
/// chain for their kind. When the last callback on a path is removed the
/// original function is put back, unless the host redefined the path while it
/// was hooked; the host's newer definition then stays.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use modhost_core::HookError;
use serde_json::Value;
use tracing::{debug, warn};

use crate::host::{HostFn, HostFunctions};
use crate::types::{HookCallback, HookKind, HookRecord, PostHook, PreHook, ReplaceHook, VoidHook};

// ---------------------------------------------------------------------------
// Per-path chains
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Owned<T> {
    owner: String,
    callback: T,
}

#[derive(Clone)]
struct PathHooks {
    original: HostFn,
    dispatcher: HostFn,
    pre: Vec<Owned<PreHook>>,
    post: Vec<Owned<PostHook>>,
    void: Vec<Owned<VoidHook>>,
    replace: Option<Owned<ReplaceHook>>,
}

impl PathHooks {
    fn new(original: HostFn, dispatcher: HostFn) -> Self {
        Self { original, dispatcher, pre: vec![], post: vec![], void: vec![], replace: None }
    }

    fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty() && self.void.is_empty() && self.replace.is_none()
    }

    fn remove_owner(&mut self, owner: &str) -> usize {
        let before = self.len();
        self.pre.retain(|h| h.owner != owner);
        self.post.retain(|h| h.owner != owner);
        self.void.retain(|h| h.owner != owner);
        if self.replace.as_ref().is_some_and(|h| h.owner == owner) {
            self.replace = None;
        }
        before - self.len()
    }

    fn len(&self) -> usize {
        self.pre.len() + self.post.len() + self.void.len() + usize::from(self.replace.is_some())
    }

    fn records(&self, path: &str) -> Vec<HookRecord> {
        let record = |kind, owner: &String| HookRecord {
            path: path.to_string(),
            kind,
            owner: owner.clone(),
        };
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.pre.iter().map(|h| record(HookKind::Pre, &h.owner)));
        out.extend(self.post.iter().map(|h| record(HookKind::Post, &h.owner)));
        out.extend(self.void.iter().map(|h| record(HookKind::Void, &h.owner)));
        out.extend(self.replace.iter().map(|h| record(HookKind::Replace, &h.owner)));
        out
    }
}

type PathMap = HashMap<String, PathHooks>;

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Thread-safe hook table bound to one host function graph.
///
/// Install and uninstall are serialised by the table lock. Dispatch copies
/// the chain out and releases the lock before running any callback, so a
/// callback may call other hooked paths or register further hooks.
#[derive(Clone)]
pub struct HookTable {
    host: Arc<HostFunctions>,
    paths: Arc<Mutex<PathMap>>,
}

impl HookTable {
    pub fn new(host: Arc<HostFunctions>) -> Self {
        Self { host, paths: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn host(&self) -> &Arc<HostFunctions> {
        &self.host
    }

    fn lock(&self) -> MutexGuard<'_, PathMap> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `callback` to the chain for its kind on `path`.
    ///
    /// Fails with `UnknownPath` if the host has nothing at `path`, and with
    /// `Conflict` if `callback` is a replace hook and one is already active.
    pub fn register(
        &self,
        path: &str,
        callback: HookCallback,
        owner: &str,
    ) -> Result<(), HookError> {
        let mut paths = self.lock();

        if matches!(callback, HookCallback::Replace(_)) {
            if let Some(existing) = paths.get(path).and_then(|p| p.replace.as_ref()) {
                return Err(HookError::Conflict {
                    path: path.to_string(),
                    owner: existing.owner.clone(),
                });
            }
        }

        if !paths.contains_key(path) {
            let original = self
                .host
                .resolve(path)
                .ok_or_else(|| HookError::UnknownPath(path.to_string()))?;
            let dispatcher = self.dispatcher(path, Arc::clone(&original));
            paths.insert(path.to_string(), PathHooks::new(original, Arc::clone(&dispatcher)));
            self.host.set(path.to_string(), dispatcher);
            debug!(path, "Installed hook dispatcher");
        }

        let Some(hooks) = paths.get_mut(path) else {
            return Err(HookError::UnknownPath(path.to_string()));
        };
        let owner = owner.to_string();
        let kind = callback.kind();
        match callback {
            HookCallback::Pre(callback) => hooks.pre.push(Owned { owner, callback }),
            HookCallback::Post(callback) => hooks.post.push(Owned { owner, callback }),
            HookCallback::Void(callback) => hooks.void.push(Owned { owner, callback }),
            HookCallback::Replace(callback) => hooks.replace = Some(Owned { owner, callback }),
        }
        debug!(path, %kind, "Registered hook");
        Ok(())
    }

    /// Remove every hook registered by `owner`. Paths left with no callbacks
    /// get their original function back. Returns the number removed.
    pub fn unregister_module(&self, owner: &str) -> usize {
        let mut paths = self.lock();
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (path, hooks) in paths.iter_mut() {
            removed += hooks.remove_owner(owner);
            if hooks.is_empty() {
                emptied.push(path.clone());
            }
        }
        for path in emptied {
            if let Some(hooks) = paths.remove(&path) {
                if self.host.swap_if_current(&path, &hooks.dispatcher, hooks.original) {
                    debug!(path = %path, "Restored original host function");
                } else {
                    debug!(path = %path, "Host redefined path while hooked; keeping its definition");
                }
            }
        }
        removed
    }

    /// Whether a dispatcher is currently installed on `path`.
    pub fn is_hooked(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    pub fn list_hooks(&self) -> Vec<HookRecord> {
        let paths = self.lock();
        let mut out: Vec<HookRecord> = paths.iter().flat_map(|(p, h)| h.records(p)).collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// The dispatcher keeps its own handle on the original so a call that
    /// resolved it just before the last unhook still reaches the original.
    fn dispatcher(&self, path: &str, original: HostFn) -> HostFn {
        let paths = Arc::downgrade(&self.paths);
        let path = path.to_string();
        Arc::new(move |args: &[Value]| {
            let chain = paths.upgrade().and_then(|paths| {
                let guard = paths.lock().unwrap_or_else(PoisonError::into_inner);
                let chain = guard.get(&path).cloned();
                chain
            });
            match chain {
                Some(chain) => dispatch(&path, chain, args),
                None => original(args),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn dispatch(path: &str, chain: PathHooks, args: &[Value]) -> Value {
    if !chain.void.is_empty() {
        for hook in &chain.void {
            if let Err(e) = (hook.callback)(args) {
                warn!(path, module = %hook.owner, error = %e, "void hook failed");
            }
        }
        return Value::Null;
    }

    let mut args = args.to_vec();
    for hook in &chain.pre {
        if let Err(e) = (hook.callback)(&mut args) {
            warn!(path, module = %hook.owner, error = %e, "pre hook failed");
        }
    }

    let mut result = match &chain.replace {
        Some(hook) => match (hook.callback)(&chain.original, &args[..]) {
            Ok(value) => value,
            Err(e) => {
                warn!(path, module = %hook.owner, error = %e, "replace hook failed; calling original");
                (chain.original)(&args[..])
            }
        },
        None => (chain.original)(&args[..]),
    };

    for hook in &chain.post {
        match (hook.callback)(&result, &args[..]) {
            Ok(Some(replacement)) => result = replacement,
            Ok(None) => {}
            Err(e) => warn!(path, module = %hook.owner, error = %e, "post hook failed"),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn host_with_counter() -> (Arc<HostFunctions>, Arc<AtomicUsize>) {
        let host = Arc::new(HostFunctions::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        host.define("friends.invite", move |args| {
            c.fetch_add(1, Ordering::SeqCst);
            json!(format!("invited {}", args.first().and_then(Value::as_str).unwrap_or("")))
        });
        (host, calls)
    }

    #[test]
    fn second_replace_conflicts_and_first_stays_active() {
        let (host, _) = host_with_counter();
        let table = HookTable::new(Arc::clone(&host));
        table
            .register("friends.invite", HookCallback::replace(|_, _| Ok(json!("first"))), "a")
            .unwrap();
        let err = table
            .register("friends.invite", HookCallback::replace(|_, _| Ok(json!("second"))), "b")
            .unwrap_err();
        assert_eq!(err, HookError::Conflict { path: "friends.invite".into(), owner: "a".into() });
        assert_eq!(host.call("friends.invite", vec![json!("bob")]).unwrap(), json!("first"));
    }

    #[test]
    fn pre_and_post_wrap_one_original_call() {
        let (host, calls) = host_with_counter();
        let table = HookTable::new(Arc::clone(&host));
        table
            .register(
                "friends.invite",
                HookCallback::pre(|args| {
                    args[0] = json!("alice");
                    Ok(())
                }),
                "a",
            )
            .unwrap();
        table
            .register(
                "friends.invite",
                HookCallback::post(|result, args| {
                    assert_eq!(args[0], json!("alice"));
                    Ok(Some(json!(format!("{}!", result.as_str().unwrap_or("")))))
                }),
                "b",
            )
            .unwrap();

        let out = host.call("friends.invite", vec![json!("bob")]).unwrap();
        assert_eq!(out, json!("invited alice!"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_hooks_chain_in_registration_order() {
        let (host, _) = host_with_counter();
        let table = HookTable::new(Arc::clone(&host));
        table
            .register("friends.invite", HookCallback::post(|_, _| Ok(Some(json!(1)))), "a")
            .unwrap();
        table
            .register(
                "friends.invite",
                HookCallback::post(|r, _| Ok(Some(json!(r.as_i64().unwrap_or(0) + 1)))),
                "b",
            )
            .unwrap();
        table
            .register("friends.invite", HookCallback::post(|_, _| anyhow::bail!("broken")), "c")
            .unwrap();
        assert_eq!(host.call("friends.invite", vec![json!("x")]).unwrap(), json!(2));
    }

    #[test]
    fn void_suppresses_original() {
        let (host, calls) = host_with_counter();
        let table = HookTable::new(Arc::clone(&host));
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        table
            .register(
                "friends.invite",
                HookCallback::void(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                "a",
            )
            .unwrap();
        assert_eq!(host.call("friends.invite", vec![json!("bob")]).unwrap(), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replace_receives_original() {
        let (host, calls) = host_with_counter();
        let table = HookTable::new(Arc::clone(&host));
        table
            .register(
                "friends.invite",
                HookCallback::replace(|original, args| {
                    let first = original(args);
                    let second = original(args);
                    Ok(json!([first, second]))
                }),
                "a",
            )
            .unwrap();
        let out = host.call("friends.invite", vec![json!("bob")]).unwrap();
        assert_eq!(out, json!(["invited bob", "invited bob"]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregister_restores_original_only_when_empty() {
        let (host, _) = host_with_counter();
        let table = HookTable::new(Arc::clone(&host));
        table.register("friends.invite", HookCallback::void(|_| Ok(())), "a").unwrap();
        table.register("friends.invite", HookCallback::pre(|_| Ok(())), "b").unwrap();

        assert_eq!(table.unregister_module("a"), 1);
        assert!(table.is_hooked("friends.invite"));
        assert_eq!(host.call("friends.invite", vec![json!("x")]).unwrap(), json!("invited x"));

        assert_eq!(table.unregister_module("b"), 1);
        assert!(!table.is_hooked("friends.invite"));
        assert!(table.list_hooks().is_empty());
        assert_eq!(host.call("friends.invite", vec![json!("y")]).unwrap(), json!("invited y"));
    }

    #[test]
    fn unknown_path_is_rejected() {
        let (host, _) = host_with_counter();
        let table = HookTable::new(host);
        let err = table.register("missing.fn", HookCallback::pre(|_| Ok(())), "a").unwrap_err();
        assert_eq!(err, HookError::UnknownPath("missing.fn".into()));
    }

    #[test]
    fn callbacks_may_call_other_hooked_paths() {
        let (host, _) = host_with_counter();
        host.define("friends.greet", |_| json!("hi"));
        let table = HookTable::new(Arc::clone(&host));
        let inner = Arc::clone(&host);
        table
            .register(
                "friends.invite",
                HookCallback::post(move |_, _| Ok(inner.call("friends.greet", vec![]).ok())),
                "a",
            )
            .unwrap();
        table.register("friends.greet", HookCallback::post(|_, _| Ok(Some(json!("hello")))), "a").unwrap();
        assert_eq!(host.call("friends.invite", vec![json!("x")]).unwrap(), json!("hello"));
    }

    #[test]
    fn unhooking_under_concurrent_calls_never_drops_the_result() {
        let host = Arc::new(HostFunctions::new());
        host.define("presence.status", |_| json!("online"));
        let table = HookTable::new(Arc::clone(&host));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let host = Arc::clone(&host);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut wrong = 0usize;
                    while !done.load(Ordering::SeqCst) {
                        if host.call("presence.status", vec![]).unwrap() != json!("online") {
                            wrong += 1;
                        }
                    }
                    wrong
                })
            })
            .collect();

        for _ in 0..5_000 {
            table.register("presence.status", HookCallback::pre(|_| Ok(())), "watcher").unwrap();
            table.unregister_module("watcher");
        }
        done.store(true, Ordering::SeqCst);

        let wrong: usize = callers.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(wrong, 0);
        assert!(!table.is_hooked("presence.status"));
    }

    #[test]
    fn host_redefinition_while_hooked_survives_unhook() {
        let (host, _) = host_with_counter();
        let table = HookTable::new(Arc::clone(&host));
        table.register("friends.invite", HookCallback::pre(|_| Ok(())), "a").unwrap();

        host.define("friends.invite", |_| json!("v2"));
        assert_eq!(table.unregister_module("a"), 1);
        assert_eq!(host.call("friends.invite", vec![json!("x")]).unwrap(), json!("v2"));
    }

    #[test]
    fn dispatcher_outliving_its_table_calls_the_original() {
        let (host, _) = host_with_counter();
        let table = HookTable::new(Arc::clone(&host));
        table.register("friends.invite", HookCallback::void(|_| Ok(())), "a").unwrap();
        drop(table);
        assert_eq!(host.call("friends.invite", vec![json!("z")]).unwrap(), json!("invited z"));
    }
}
