//! Start Sequencer
//!
//! Starts modules concurrently, each one first waiting a bounded time for
//! its declared dependencies to reach the started state. There is no
//! topological sort and no cycle detection: a cycle simply times out.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use modhost_config::DependencyConfig;
use modhost_config::defaults::{DEFAULT_OPTIONAL_TIMEOUT_MS, DEFAULT_REQUIRED_TIMEOUT_MS};
use modhost_core::{DependencyTimeout, LifecyclePhase, ModHostError};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::module::Module;
use crate::registry::ModuleRegistry;

/// Wait windows for dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyWindows {
    pub required: Duration,
    pub optional: Duration,
}

impl Default for DependencyWindows {
    fn default() -> Self {
        Self {
            required: Duration::from_millis(DEFAULT_REQUIRED_TIMEOUT_MS),
            optional: Duration::from_millis(DEFAULT_OPTIONAL_TIMEOUT_MS),
        }
    }
}

impl From<&DependencyConfig> for DependencyWindows {
    fn from(config: &DependencyConfig) -> Self {
        Self {
            required: Duration::from_millis(config.required_timeout_ms.unwrap_or(DEFAULT_REQUIRED_TIMEOUT_MS)),
            optional: Duration::from_millis(config.optional_timeout_ms.unwrap_or(DEFAULT_OPTIONAL_TIMEOUT_MS)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub started: Vec<String>,
    /// `(module id, reason)`
    pub failed: Vec<(String, String)>,
    /// Disabled modules.
    pub skipped: Vec<String>,
}

impl StartReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Outcome {
    Started,
    Skipped,
    Failed(String),
}

pub struct StartSequencer {
    registry: Arc<ModuleRegistry>,
    windows: DependencyWindows,
}

impl StartSequencer {
    pub fn new(registry: Arc<ModuleRegistry>, windows: DependencyWindows) -> Self {
        Self { registry, windows }
    }

    pub fn windows(&self) -> DependencyWindows {
        self.windows
    }

    /// Wait until module `id` is started. Returns false on timeout.
    pub async fn wait_for_started(&self, id: &str, window: Duration) -> bool {
        let mut changes = self.registry.subscribe_changes();
        let wait = async {
            loop {
                if self.registry.is_started(id) {
                    return;
                }
                if changes.changed().await.is_err() {
                    // No more state changes can arrive; let the window run out.
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(window, wait).await.is_ok()
    }

    /// Wait for dependencies, then start. Required dependencies that never
    /// start fail the module; optional ones only log a warning.
    pub async fn start_module(&self, module: &Module) -> Result<(), ModHostError> {
        let meta = module.metadata();

        let required = join_all(meta.required.iter().map(|dep| self.wait_for_started(dep, self.windows.required))).await;
        if let Some((dep, _)) = meta.required.iter().zip(&required).find(|(_, ok)| !**ok) {
            let timeout = DependencyTimeout {
                module: module.id().to_string(),
                dependency: dep.clone(),
                required: true,
                waited_ms: self.windows.required.as_millis() as u64,
            };
            error!(module = %module.id(), dependency = %dep, "{timeout}");
            module.mark_failed(LifecyclePhase::Start, timeout.to_string());
            return Err(timeout.into());
        }

        let optional = join_all(meta.optional.iter().map(|dep| self.wait_for_started(dep, self.windows.optional))).await;
        for (dep, ok) in meta.optional.iter().zip(optional) {
            if !ok {
                let timeout = DependencyTimeout {
                    module: module.id().to_string(),
                    dependency: dep.clone(),
                    required: false,
                    waited_ms: self.windows.optional.as_millis() as u64,
                };
                warn!(module = %module.id(), dependency = %dep, "{timeout}; continuing without it");
            }
        }

        module.start().await?;
        Ok(())
    }

    /// Start every given module concurrently.
    pub async fn start_all(&self, modules: &[Arc<Module>]) -> StartReport {
        let outcomes = join_all(modules.iter().map(|m| self.start_one(m))).await;
        let mut report = StartReport::default();
        for (module, outcome) in modules.iter().zip(outcomes) {
            let id = module.id().to_string();
            match outcome {
                Outcome::Started => report.started.push(id),
                Outcome::Skipped => report.skipped.push(id),
                Outcome::Failed(reason) => report.failed.push((id, reason)),
            }
        }
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Start pass complete"
        );
        report
    }

    async fn start_one(&self, module: &Module) -> Outcome {
        if !module.is_enabled() {
            return Outcome::Skipped;
        }
        if module.is_started() {
            return Outcome::Started;
        }
        match self.start_module(module).await {
            Ok(()) => Outcome::Started,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }
}
