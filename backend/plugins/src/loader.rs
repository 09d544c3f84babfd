//! Load Pipeline
//!
//! Turns URLs into registered module instances. Fetches run concurrently;
//! script evaluation and the bootstrap-slot read happen under one FIFO lock
//! so every definition is attributed to the URL that produced it. URLs that
//! fail are remembered for the rest of the session and never retried.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use modhost_core::{LoadError, Notifier, NotifyLevel, ScriptFetcher};
use modhost_logging::{LifecycleLogger, ModuleEvent, redact_url};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::context::ModuleServices;
use crate::engine::ScriptEngine;
use crate::fetch::{RetryPolicy, fetch_with_retry};
use crate::module::Module;
use crate::registry::ModuleRegistry;

type LoadOutcome = Result<Arc<Module>, LoadError>;

pub struct LoadPipeline {
    fetcher: Arc<dyn ScriptFetcher>,
    engine: Arc<dyn ScriptEngine>,
    registry: Arc<ModuleRegistry>,
    services: ModuleServices,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    // tokio's Mutex is fair, so queued executions run in arrival order.
    exec_lock: tokio::sync::Mutex<()>,
    loaded: Mutex<HashSet<String>>,
    failed: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<LoadOutcome>>>>,
}

impl LoadPipeline {
    pub fn new(
        fetcher: Arc<dyn ScriptFetcher>,
        engine: Arc<dyn ScriptEngine>,
        registry: Arc<ModuleRegistry>,
        services: ModuleServices,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fetcher,
            engine,
            registry,
            notifier: Arc::clone(&services.notifier),
            services,
            retry,
            exec_lock: tokio::sync::Mutex::new(()),
            loaded: Mutex::default(),
            failed: Mutex::default(),
            in_flight: Mutex::default(),
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn ScriptFetcher> {
        &self.fetcher
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn is_loaded(&self, url: &str) -> bool {
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner).contains(url)
    }

    pub fn has_failed(&self, url: &str) -> bool {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner).contains(url)
    }

    pub fn loaded_urls(&self) -> Vec<String> {
        sorted(&self.loaded)
    }

    pub fn failed_urls(&self) -> Vec<String> {
        sorted(&self.failed)
    }

    /// Let `url` be loaded again after its module was unloaded.
    pub fn forget(&self, url: &str) {
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner).remove(url);
    }

    /// Load one URL and run the module's `load`. A URL that is already
    /// loaded resolves to the existing instance; concurrent calls for the
    /// same URL share one attempt.
    pub async fn load(&self, url: &str) -> LoadOutcome {
        if self.has_failed(url) {
            debug!(url = %redact_url(url), "Skipping URL that failed earlier");
            return Err(LoadError::CircuitOpen(redact_url(url)));
        }
        if let Some(existing) = self.registry.by_url(url) {
            return Ok(existing);
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(in_flight.entry(url.to_string()).or_default())
        };
        let outcome = cell.get_or_init(|| self.load_uncached(url)).await.clone();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.get(url).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                in_flight.remove(url);
            }
        }
        outcome
    }

    /// Load several URLs. Fetches overlap; evaluation is serialized.
    /// Results are in input order.
    pub async fn load_many(&self, urls: &[String]) -> Vec<(String, LoadOutcome)> {
        let outcomes = join_all(urls.iter().map(|url| self.load(url))).await;
        urls.iter().cloned().zip(outcomes).collect()
    }

    async fn load_uncached(&self, url: &str) -> LoadOutcome {
        let module = match self.fetch_and_define(url).await {
            Ok(module) => module,
            Err(e) => {
                self.record_failure(url, &e);
                return Err(e);
            }
        };

        // Lifecycle load runs outside the execution lock. A failure leaves
        // the module registered in the failed state.
        if let Err(e) = module.load().await {
            error!(module = %module.id(), error = %e, "Module load failed");
        } else {
            info!(module = %module.id(), url = %redact_url(url), "Module loaded");
        }
        Ok(module)
    }

    async fn fetch_and_define(&self, url: &str) -> LoadOutcome {
        let (source, attempts) = fetch_with_retry(self.fetcher.as_ref(), url, self.retry).await?;
        LifecycleLogger::log_event(&modhost_core::derive_module_id(url), ModuleEvent::Fetched {
            url: url.to_string(),
            attempts,
        });

        let _exec = self.exec_lock.lock().await;
        // A stale definition from an earlier script must never be attributed here.
        if self.engine.slot().take().is_some() {
            warn!(url = %redact_url(url), "Discarding unclaimed module definition");
        }
        let executed = self.engine.execute(url, &source).await;
        let definition = self.engine.slot().take();

        let attribution = |reason: String| LoadError::Attribution { url: redact_url(url), reason };
        if let Err(e) = executed {
            return Err(attribution(format!("script raised: {e:#}")));
        }
        let mut definition = definition.ok_or_else(|| attribution("no module was defined".into()))?;
        definition.metadata.attribute(url);

        let module = Arc::new(Module::new(definition.metadata, definition.behavior, &self.services));
        if let Err(existing) = self.registry.insert(Arc::clone(&module)) {
            return Err(attribution(format!("module id '{}' is already registered", existing.id())));
        }
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner).insert(url.to_string());
        LifecycleLogger::log_event(module.id(), ModuleEvent::Attributed { url: url.to_string() });
        Ok(module)
    }

    fn record_failure(&self, url: &str, error: &LoadError) {
        warn!(url = %redact_url(url), error = %error, "Module load failed; not retrying this session");
        self.failed.lock().unwrap_or_else(PoisonError::into_inner).insert(url.to_string());
        self.notifier.notify(NotifyLevel::Error, "Module load failed", &error.to_string());
    }
}

fn sorted(set: &Mutex<HashSet<String>>) -> Vec<String> {
    let mut urls: Vec<_> = set.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect();
    urls.sort();
    urls
}
