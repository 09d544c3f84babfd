//! Orchestrator
//!
//! Owns the host function graph, hook table, event registry, module
//! registry, load pipeline and start sequencer, and exposes the entry points
//! a host application drives: load, start, stop, unload, reload, enable,
//! disable and login fan-out.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use modhost_config::{FetchConfig, ModHostConfig};
use modhost_config::defaults::DEFAULT_BROADCAST_CAPACITY;
use modhost_core::{
    HostUser, MemorySettingsStore, ModHostError, Notifier, OperationResult, RepositoryDescriptor, ScriptFetcher,
    SettingsStore, TracingNotifier,
};
use modhost_events::EventRegistry;
use modhost_hooks::{HookTable, HostFunctions};
use modhost_logging::{LifecycleLogger, ModuleEvent, redact_url};
use tracing::{info, warn};

use crate::context::ModuleServices;
use crate::engine::ScriptEngine;
use crate::fetch::{HttpFetcher, RetryPolicy, fetch_with_retry};
use crate::loader::LoadPipeline;
use crate::module::{Module, ModuleSummary};
use crate::registry::ModuleRegistry;
use crate::sequencer::{DependencyWindows, StartReport, StartSequencer};

pub struct OrchestratorBuilder {
    fetcher: Option<Arc<dyn ScriptFetcher>>,
    engine: Option<Arc<dyn ScriptEngine>>,
    host: Option<Arc<HostFunctions>>,
    settings: Option<Arc<dyn SettingsStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    fetch: FetchConfig,
    retry: RetryPolicy,
    windows: DependencyWindows,
    broadcast_capacity: usize,
    disabled: HashSet<String>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            fetcher: None,
            engine: None,
            host: None,
            settings: None,
            notifier: None,
            fetch: FetchConfig::default(),
            retry: RetryPolicy::default(),
            windows: DependencyWindows::default(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            disabled: HashSet::new(),
        }
    }
}

impl OrchestratorBuilder {
    /// Take fetch policy, dependency windows, broadcast capacity and the
    /// disabled list from a prepared config.
    pub fn config(mut self, config: &ModHostConfig) -> Self {
        self.fetch = config.fetch();
        self.retry = RetryPolicy::from(&self.fetch);
        self.windows = DependencyWindows::from(&config.dependencies());
        self.broadcast_capacity = config.events().broadcast_capacity.unwrap_or(DEFAULT_BROADCAST_CAPACITY);
        self.disabled = config.disabled.iter().cloned().collect();
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ScriptFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn host(mut self, host: Arc<HostFunctions>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn windows(mut self, windows: DependencyWindows) -> Self {
        self.windows = windows;
        self
    }

    pub fn disable(mut self, id: impl Into<String>) -> Self {
        self.disabled.insert(id.into());
        self
    }

    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::from_config(&self.fetch)?),
        };
        let engine = match self.engine {
            Some(engine) => engine,
            None => default_engine()?,
        };
        let host = self.host.unwrap_or_default();
        let services = ModuleServices::new(
            HookTable::new(Arc::clone(&host)),
            EventRegistry::new(self.broadcast_capacity),
            self.settings.unwrap_or_else(|| Arc::new(MemorySettingsStore::new())),
            self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
        );
        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&services.changes)));
        let pipeline = LoadPipeline::new(fetcher, engine, Arc::clone(&registry), services.clone(), self.retry);
        let sequencer = StartSequencer::new(Arc::clone(&registry), self.windows);
        Ok(Orchestrator { host, services, registry, pipeline, sequencer, disabled: self.disabled })
    }
}

#[cfg(feature = "lua")]
fn default_engine() -> anyhow::Result<Arc<dyn ScriptEngine>> {
    Ok(Arc::new(crate::lua::LuaEngine::new()?))
}

#[cfg(not(feature = "lua"))]
fn default_engine() -> anyhow::Result<Arc<dyn ScriptEngine>> {
    anyhow::bail!("no script engine configured and the `lua` feature is disabled")
}

pub struct Orchestrator {
    host: Arc<HostFunctions>,
    services: ModuleServices,
    registry: Arc<ModuleRegistry>,
    pipeline: LoadPipeline,
    sequencer: StartSequencer,
    disabled: HashSet<String>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn host(&self) -> &Arc<HostFunctions> {
        &self.host
    }

    pub fn hooks(&self) -> &HookTable {
        &self.services.hooks
    }

    pub fn events(&self) -> &EventRegistry {
        &self.services.events
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &LoadPipeline {
        &self.pipeline
    }

    pub fn modules(&self) -> Vec<ModuleSummary> {
        self.registry.list().iter().map(|m| m.summary()).collect()
    }

    pub fn module(&self, id: &str) -> Option<Arc<Module>> {
        self.registry.get(id)
    }

    fn apply_disabled(&self, module: &Module) {
        if self.disabled.contains(module.id()) {
            module.set_enabled(false);
        }
    }

    pub async fn load_url(&self, url: &str) -> OperationResult {
        match self.pipeline.load(url).await {
            Ok(module) => {
                self.apply_disabled(&module);
                match module.failure() {
                    Some(reason) => OperationResult::failed(format!("{}: {reason}", module.id())),
                    None => OperationResult::ok_with(module.id()),
                }
            }
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    /// Load every URL; returns the modules that now exist for them.
    pub async fn load_urls(&self, urls: &[String]) -> Vec<Arc<Module>> {
        let mut loaded = Vec::new();
        for (url, outcome) in self.pipeline.load_many(urls).await {
            match outcome {
                Ok(module) => {
                    self.apply_disabled(&module);
                    loaded.push(module);
                }
                Err(e) => warn!(url = %redact_url(&url), error = %e, "Skipping module"),
            }
        }
        loaded
    }

    pub async fn fetch_repository(&self, url: &str) -> Result<RepositoryDescriptor, ModHostError> {
        let (raw, _) = fetch_with_retry(self.pipeline.fetcher().as_ref(), url, self.pipeline.retry_policy()).await?;
        let descriptor = RepositoryDescriptor::parse(&raw)?;
        info!(url = %redact_url(url), modules = descriptor.modules.len(), "Fetched repository");
        Ok(descriptor)
    }

    pub async fn load_repository(&self, repository: &RepositoryDescriptor) -> Vec<Arc<Module>> {
        self.load_urls(&repository.enabled_urls()).await
    }

    /// Start every loaded, enabled module that is not failed.
    pub async fn start_all(&self) -> StartReport {
        let modules: Vec<_> = self.registry.list().into_iter().filter(|m| !m.is_failed()).collect();
        self.sequencer.start_all(&modules).await
    }

    /// Stop every module in reverse load order. Returns how many stopped.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for module in self.registry.list().into_iter().rev() {
            if !module.is_started() {
                continue;
            }
            if let Err(e) = module.stop().await {
                warn!(module = %module.id(), error = %e, "Stop raised");
            }
            stopped += 1;
        }
        info!(stopped, "All modules stopped");
        stopped
    }

    pub async fn unload(&self, id: &str) -> OperationResult {
        let Some(module) = self.registry.get(id) else {
            return OperationResult::failed(ModHostError::ModuleNotFound(id.to_string()).to_string());
        };
        if let Err(e) = module.stop().await {
            warn!(module = %id, error = %e, "Stop raised during unload");
        }
        self.services.events.unregister_module(id);
        self.registry.remove(id);
        if let Some(url) = module.url() {
            self.pipeline.forget(url);
        }
        LifecycleLogger::log_event(id, ModuleEvent::Unloaded);
        OperationResult::ok()
    }

    /// Unload and load again from the same URL, restarting if it was running.
    pub async fn reload(&self, id: &str) -> OperationResult {
        let Some(module) = self.registry.get(id) else {
            return OperationResult::failed(ModHostError::ModuleNotFound(id.to_string()).to_string());
        };
        let Some(url) = module.url().map(str::to_string) else {
            return OperationResult::failed(format!("{id} has no source URL to reload from"));
        };
        let was_started = module.is_started();
        drop(module);

        let unloaded = self.unload(id).await;
        if !unloaded.success {
            return unloaded;
        }
        let loaded = self.load_url(&url).await;
        if !loaded.success || !was_started {
            return loaded;
        }
        match self.registry.by_url(&url) {
            Some(fresh) => match self.sequencer.start_module(&fresh).await {
                Ok(()) => OperationResult::ok_with(fresh.id()),
                Err(e) => OperationResult::failed(e.to_string()),
            },
            None => OperationResult::failed(format!("{id} vanished during reload")),
        }
    }

    pub async fn enable(&self, id: &str) -> OperationResult {
        let Some(module) = self.registry.get(id) else {
            return OperationResult::failed(ModHostError::ModuleNotFound(id.to_string()).to_string());
        };
        module.set_enabled(true);
        if module.is_started() {
            return OperationResult::ok();
        }
        match self.sequencer.start_module(&module).await {
            Ok(()) => OperationResult::ok(),
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    pub async fn disable(&self, id: &str) -> OperationResult {
        let Some(module) = self.registry.get(id) else {
            return OperationResult::failed(ModHostError::ModuleNotFound(id.to_string()).to_string());
        };
        module.set_enabled(false);
        match module.stop().await {
            Ok(_) => OperationResult::ok(),
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    /// Forward a login to every module that has not failed. Returns the
    /// number of modules whose handler raised.
    pub async fn handle_login(&self, user: &HostUser) -> usize {
        let modules = self.registry.list();
        let results = join_all(modules.iter().map(|m| m.on_login(user))).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        info!(user = %user.id, modules = modules.len(), failures, "Login dispatched");
        failures
    }
}

pub mod global {
    //! Process-wide orchestrator handle.

    use std::sync::{Arc, PoisonError, RwLock};

    use once_cell::sync::Lazy;

    use super::Orchestrator;

    static INSTANCE: Lazy<RwLock<Option<Arc<Orchestrator>>>> = Lazy::new(|| RwLock::new(None));

    /// Install `orchestrator` as the process-wide instance, replacing any other.
    pub fn init(orchestrator: Orchestrator) -> Arc<Orchestrator> {
        let orchestrator = Arc::new(orchestrator);
        *INSTANCE.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&orchestrator));
        orchestrator
    }

    pub fn get() -> Option<Arc<Orchestrator>> {
        INSTANCE.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Remove the process-wide instance. The caller decides whether to stop it.
    pub fn reset() -> Option<Arc<Orchestrator>> {
        INSTANCE.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModuleContext;
    use crate::engine::{ModuleDefinition, NativeEngine};
    use crate::fetch::tests::MapFetcher;
    use crate::lifecycle::{ModuleBehavior, ModuleState};
    use anyhow::bail;
    use async_trait::async_trait;
    use modhost_core::ModuleMetadata;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Tracked {
        fail_start: bool,
        ticks: Arc<AtomicUsize>,
        logins: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ModuleBehavior for Tracked {
        async fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
            if self.fail_start {
                bail!("start refused");
            }
            let ticks = Arc::clone(&self.ticks);
            ctx.every(Duration::from_millis(100), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        }

        async fn on_login(&self, ctx: &ModuleContext, user: &HostUser) -> anyhow::Result<()> {
            self.logins.lock().unwrap().push(format!("{}:{}", ctx.id(), user.id));
            Ok(())
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        ticks: Arc<AtomicUsize>,
        logins: Arc<Mutex<Vec<String>>>,
        builds: Arc<AtomicUsize>,
    }

    /// `a` fails to start when `a_fails`; `b` requires `a`; `c` is independent.
    fn harness(a_fails: bool) -> Harness {
        let ticks = Arc::new(AtomicUsize::new(0));
        let logins = Arc::new(Mutex::new(Vec::new()));
        let builds = Arc::new(AtomicUsize::new(0));
        let engine = NativeEngine::new();
        for (name, meta, fail) in [
            ("a", ModuleMetadata::new("a"), a_fails),
            ("b", ModuleMetadata::new("b").requires("a"), false),
            ("c", ModuleMetadata::new("c"), false),
        ] {
            let (ticks, logins, builds) = (Arc::clone(&ticks), Arc::clone(&logins), Arc::clone(&builds));
            engine.register(name, move || {
                builds.fetch_add(1, Ordering::SeqCst);
                ModuleDefinition {
                    metadata: meta.clone(),
                    behavior: Arc::new(Tracked {
                        fail_start: fail,
                        ticks: Arc::clone(&ticks),
                        logins: Arc::clone(&logins),
                    }),
                }
            });
        }
        let repo = json!({
            "name": "test",
            "modules": [
                { "id": "a", "url": "builtin://a" },
                { "id": "b", "url": "builtin://b" },
                { "id": "c", "url": "builtin://c" },
                { "id": "off", "url": "builtin://off", "enabled": false }
            ]
        });
        let fetcher = MapFetcher::default()
            .with("builtin://a", "a")
            .with("builtin://b", "b")
            .with("builtin://c", "c")
            .with("https://m.dev/repo.json", &repo.to_string());
        let host = Arc::new(HostFunctions::new());
        host.define("ui.toast", |args: &[Value]| json!(args.len()));
        let orchestrator = Orchestrator::builder()
            .fetcher(Arc::new(fetcher))
            .engine(Arc::new(engine))
            .host(host)
            .retry(RetryPolicy { max_retries: 0, delay: Duration::ZERO })
            .build()
            .unwrap();
        Harness { orchestrator, ticks, logins, builds }
    }

    async fn load_repo(h: &Harness) {
        let repo = h.orchestrator.fetch_repository("https://m.dev/repo.json").await.unwrap();
        let loaded = h.orchestrator.load_repository(&repo).await;
        assert_eq!(loaded.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_dependency_fails_its_dependent() {
        let h = harness(true);
        load_repo(&h).await;

        let report = h.orchestrator.start_all().await;
        assert_eq!(report.started, vec!["c"]);
        let failed: Vec<_> = report.failed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(failed, vec!["a", "b"]);
        assert_eq!(h.orchestrator.module("b").unwrap().state(), ModuleState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_silences_timers() {
        let h = harness(false);
        load_repo(&h).await;
        assert!(h.orchestrator.start_all().await.is_clean());

        tokio::time::sleep(Duration::from_millis(350)).await;
        let before = h.ticks.load(Ordering::SeqCst);
        assert_eq!(before, 9);

        assert_eq!(h.orchestrator.stop_all().await, 3);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.ticks.load(Ordering::SeqCst), before);
        assert!(h.orchestrator.modules().iter().all(|m| m.resources == 0 && m.state == ModuleState::Loaded));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_builds_a_fresh_started_instance() {
        let h = harness(false);
        load_repo(&h).await;
        h.orchestrator.start_all().await;
        let old = h.orchestrator.module("c").unwrap();

        let result = h.orchestrator.reload("c").await;
        assert!(result.success, "{result:?}");
        let fresh = h.orchestrator.module("c").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.is_started());
        assert_eq!(old.state(), ModuleState::Loaded);
        assert_eq!(h.builds.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unload_allows_loading_again() {
        let h = harness(false);
        load_repo(&h).await;
        assert!(h.orchestrator.unload("c").await.success);
        assert!(h.orchestrator.module("c").is_none());
        assert!(!h.orchestrator.pipeline().is_loaded("builtin://c"));

        let again = h.orchestrator.load_url("builtin://c").await;
        assert_eq!(again, OperationResult::ok_with("c"));
        assert!(!h.orchestrator.unload("missing").await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn declared_events_survive_disable_but_not_unload() {
        let h = harness(false);
        load_repo(&h).await;
        let c = h.orchestrator.module("c").unwrap();
        c.context().register_event("c.ping", modhost_events::EventOptions::default().broadcast());
        h.orchestrator.start_all().await;

        assert!(h.orchestrator.disable("c").await.success);
        assert!(h.orchestrator.enable("c").await.success);
        assert!(c.is_started());
        assert!(h.orchestrator.events().event("c.ping").unwrap().options.broadcast);

        assert!(h.orchestrator.unload("c").await.success);
        assert!(!h.orchestrator.events().is_registered("c.ping"));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_modules_sit_out_start_all() {
        let h = harness(false);
        load_repo(&h).await;
        assert!(h.orchestrator.disable("c").await.success);

        let report = h.orchestrator.start_all().await;
        assert_eq!(report.skipped, vec!["c"]);
        assert!(!h.orchestrator.module("c").unwrap().is_started());

        assert!(h.orchestrator.enable("c").await.success);
        assert!(h.orchestrator.module("c").unwrap().is_started());
        assert!(h.orchestrator.disable("c").await.success);
        assert!(!h.orchestrator.module("c").unwrap().is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn login_reaches_every_module() {
        let h = harness(false);
        load_repo(&h).await;
        let user = HostUser { id: "usr_7".into(), display_name: "Kit".into() };
        assert_eq!(h.orchestrator.handle_login(&user).await, 0);
        let mut logins = h.logins.lock().unwrap().clone();
        logins.sort();
        assert_eq!(logins, vec!["a:usr_7", "b:usr_7", "c:usr_7"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_urls_report_failure() {
        let h = harness(false);
        let result = h.orchestrator.load_url("builtin://nope").await;
        assert!(!result.success);
        assert!(h.orchestrator.pipeline().has_failed("builtin://nope"));
        assert!(h.orchestrator.fetch_repository("https://m.dev/missing.json").await.is_err());
    }

    #[test]
    fn global_instance_round_trip() {
        global::reset();
        let installed = global::init(harness(false).orchestrator);
        let fetched = global::get().unwrap();
        assert!(Arc::ptr_eq(&installed, &fetched));
        assert!(global::reset().is_some());
        assert!(global::get().is_none());
    }
}
