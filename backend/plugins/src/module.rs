//! A loaded module instance and its lifecycle transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use modhost_core::{HostUser, LifecycleError, LifecyclePhase, ModuleAction, ModuleMetadata, NotifyLevel};
use modhost_logging::{LifecycleLogger, ModuleEvent};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::context::{ModuleContext, ModuleServices};
use crate::lifecycle::{ModuleBehavior, ModuleState};
use crate::settings::SettingDefinition;

pub struct Module {
    metadata: ModuleMetadata,
    behavior: Arc<dyn ModuleBehavior>,
    ctx: ModuleContext,
    services: ModuleServices,
    state: Mutex<ModuleState>,
    failure: Mutex<Option<String>>,
    enabled: AtomicBool,
    // Serializes transitions of this one module.
    transition: tokio::sync::Mutex<()>,
}

/// Serializable view for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSummary {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub url: Option<String>,
    pub state: ModuleState,
    pub enabled: bool,
    pub resources: usize,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Module {
    pub fn new(metadata: ModuleMetadata, behavior: Arc<dyn ModuleBehavior>, services: &ModuleServices) -> Self {
        let ctx = ModuleContext::new(metadata.id.clone(), services);
        Self {
            metadata,
            behavior,
            ctx,
            services: services.clone(),
            state: Mutex::new(ModuleState::Constructed),
            failure: Mutex::new(None),
            enabled: AtomicBool::new(true),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    pub fn url(&self) -> Option<&str> {
        self.metadata.url.as_deref()
    }

    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    pub fn state(&self) -> ModuleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_started(&self) -> bool {
        self.state() == ModuleState::Started
    }

    pub fn is_failed(&self) -> bool {
        self.state() == ModuleState::Failed
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn actions(&self) -> Vec<ModuleAction> {
        self.ctx.actions()
    }

    pub fn settings_schema(&self) -> Vec<SettingDefinition> {
        self.ctx.settings().definitions()
    }

    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            id: self.metadata.id.clone(),
            name: self.metadata.name.clone(),
            version: self.metadata.version.clone(),
            url: self.metadata.url.clone(),
            state: self.state(),
            enabled: self.is_enabled(),
            resources: self.ctx.resource_count(),
            required: self.metadata.required.clone(),
            optional: self.metadata.optional.clone(),
            tags: self.metadata.tags.clone(),
            failure: self.failure(),
        }
    }

    fn set_state(&self, state: ModuleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.services.state_changed();
    }

    /// Move to `Failed`, recording why. Waiters are notified.
    pub fn mark_failed(&self, phase: LifecyclePhase, reason: impl Into<String>) -> LifecycleError {
        let reason = reason.into();
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        LifecycleLogger::log_event(self.id(), ModuleEvent::Failed { phase: phase.to_string(), error: reason.clone() });
        self.set_state(ModuleState::Failed);
        self.ctx.notify(NotifyLevel::Error, &format!("{phase} failed: {reason}"));
        LifecycleError { module: self.id().to_string(), phase, message: reason }
    }

    /// Run the module's `load` once. Later calls are no-ops.
    pub async fn load(&self) -> Result<(), LifecycleError> {
        let _transition = self.transition.lock().await;
        if self.state() != ModuleState::Constructed {
            return Ok(());
        }
        match self.behavior.load(&self.ctx).await {
            Ok(()) => {
                self.set_state(ModuleState::Loaded);
                LifecycleLogger::log_event(self.id(), ModuleEvent::Loaded);
                Ok(())
            }
            Err(e) => Err(self.mark_failed(LifecyclePhase::Load, format!("{e:#}"))),
        }
    }

    /// Run `start`. Already started is a no-op; anything but `Loaded` is an error.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let _transition = self.transition.lock().await;
        match self.state() {
            ModuleState::Started => return Ok(()),
            ModuleState::Loaded => {}
            other => {
                return Err(LifecycleError {
                    module: self.id().to_string(),
                    phase: LifecyclePhase::Start,
                    message: format!("cannot start from state '{other}'"),
                });
            }
        }
        self.ctx.set_running(true);
        match self.behavior.start(&self.ctx).await {
            Ok(()) => {
                self.set_state(ModuleState::Started);
                LifecycleLogger::log_event(self.id(), ModuleEvent::Started);
                info!(module = %self.id(), resources = self.ctx.resource_count(), "Module started");
                Ok(())
            }
            Err(e) => {
                // Whatever start acquired before failing is released now.
                self.teardown();
                Err(self.mark_failed(LifecyclePhase::Start, format!("{e:#}")))
            }
        }
    }

    /// Stop a started module and release everything it acquired. Returns
    /// the number of ledger entries released. Not started is a no-op.
    pub async fn stop(&self) -> Result<usize, LifecycleError> {
        let _transition = self.transition.lock().await;
        if self.state() != ModuleState::Started {
            return Ok(0);
        }
        let stopped = self.behavior.stop(&self.ctx).await;
        let released = self.teardown();
        self.set_state(ModuleState::Loaded);
        LifecycleLogger::log_event(self.id(), ModuleEvent::Stopped { released });
        match stopped {
            Ok(()) => Ok(released),
            Err(e) => {
                warn!(module = %self.id(), error = %e, "Module stop raised; resources released anyway");
                Err(LifecycleError {
                    module: self.id().to_string(),
                    phase: LifecyclePhase::Stop,
                    message: format!("{e:#}"),
                })
            }
        }
    }

    /// Forward a login to the module. Failed modules are skipped.
    pub async fn on_login(&self, user: &HostUser) -> Result<(), LifecycleError> {
        if self.is_failed() {
            return Ok(());
        }
        self.behavior.on_login(&self.ctx, user).await.map_err(|e| {
            error!(module = %self.id(), error = %e, "on_login failed");
            LifecycleError { module: self.id().to_string(), phase: LifecyclePhase::Login, message: format!("{e:#}") }
        })
    }

    fn teardown(&self) -> usize {
        let report = self.ctx.release_all();
        self.ctx.set_running(false);
        let hooks = self.services.hooks.unregister_module(self.id());
        self.services.events.unsubscribe_module(self.id());
        if hooks > 0 {
            info!(module = %self.id(), hooks, "Removed module hooks");
        }
        report.released + report.failed
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("id", &self.metadata.id).field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::services;
    use anyhow::bail;
    use async_trait::async_trait;
    use modhost_hooks::HookCallback;
    use modhost_events::EventOptions;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_start: bool,
    }

    #[async_trait]
    impl ModuleBehavior for Recorder {
        async fn load(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("load");
            Ok(())
        }

        async fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("start");
            ctx.every(Duration::from_secs(1), || {});
            ctx.hook("chat.send", HookCallback::void(|_| Ok(())))?;
            if self.fail_start {
                bail!("boom");
            }
            Ok(())
        }

        async fn stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("stop");
            Ok(())
        }
    }

    fn module(fail_start: bool) -> (Module, Arc<Mutex<Vec<&'static str>>>, ModuleServices) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let services = services();
        let m = Module::new(
            ModuleMetadata::new("rec"),
            Arc::new(Recorder { calls: Arc::clone(&calls), fail_start }),
            &services,
        );
        (m, calls, services)
    }

    #[tokio::test]
    async fn load_runs_once() {
        let (m, calls, _) = module(false);
        m.load().await.unwrap();
        m.load().await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["load"]);
        assert_eq!(m.state(), ModuleState::Loaded);
    }

    #[tokio::test]
    async fn start_requires_load() {
        let (m, _, _) = module(false);
        let err = m.start().await.unwrap_err();
        assert_eq!(err.phase, LifecyclePhase::Start);
        assert_eq!(m.state(), ModuleState::Constructed);
    }

    #[tokio::test]
    async fn stop_releases_everything_and_allows_restart() {
        let (m, calls, services) = module(false);
        m.load().await.unwrap();
        m.start().await.unwrap();
        assert!(m.is_started());
        assert_eq!(m.context().resource_count(), 1);
        assert!(services.hooks.is_hooked("chat.send"));
        assert_eq!(services.hooks.host().call("chat.send", vec![json!(1)]).unwrap(), Value::Null);

        assert_eq!(m.stop().await.unwrap(), 1);
        assert_eq!(m.state(), ModuleState::Loaded);
        assert_eq!(m.context().resource_count(), 0);
        assert!(!services.hooks.is_hooked("chat.send"));
        assert_eq!(services.hooks.host().call("chat.send", vec![json!(1)]).unwrap(), json!({ "sent": 1 }));

        assert_eq!(m.stop().await.unwrap(), 0);
        m.start().await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["load", "start", "stop", "start"]);
    }

    #[tokio::test]
    async fn failed_start_cleans_up() {
        let (m, _, services) = module(true);
        m.load().await.unwrap();
        let err = m.start().await.unwrap_err();
        assert!(err.message.contains("boom"));
        assert!(m.is_failed());
        assert_eq!(m.failure().as_deref(), Some("boom"));
        assert_eq!(m.context().resource_count(), 0);
        assert!(!services.hooks.is_hooked("chat.send"));
        assert!(m.start().await.is_err());
    }

    #[tokio::test]
    async fn state_changes_are_broadcast() {
        let (m, _, services) = module(false);
        let rx = services.changes.subscribe();
        let before = *rx.borrow();
        m.load().await.unwrap();
        m.start().await.unwrap();
        assert_eq!(*rx.borrow(), before + 2);
    }

    #[tokio::test]
    async fn login_errors_are_reported() {
        struct Grumpy(AtomicUsize);

        #[async_trait]
        impl ModuleBehavior for Grumpy {
            async fn on_login(&self, _ctx: &ModuleContext, user: &HostUser) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                bail!("no greeting for {}", user.display_name)
            }
        }

        let services = services();
        let m = Module::new(ModuleMetadata::new("grumpy"), Arc::new(Grumpy(AtomicUsize::new(0))), &services);
        m.load().await.unwrap();
        let user = HostUser { id: "usr_1".into(), display_name: "Ada".into() };
        let err = m.on_login(&user).await.unwrap_err();
        assert_eq!(err.phase, LifecyclePhase::Login);
        assert!(!m.is_failed());
    }

    struct Announcer;

    #[async_trait]
    impl ModuleBehavior for Announcer {
        async fn load(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
            ctx.register_event("announcer.loud", EventOptions::described("Shouted").broadcast());
            Ok(())
        }

        async fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
            ctx.register_event("announcer.session", EventOptions::default());
            ctx.emit("announcer.loud", json!({ "n": 1 }));
            Ok(())
        }
    }

    #[tokio::test]
    async fn restart_keeps_events_declared_during_load() {
        let services = services();
        let mut rx = services.events.subscribe_broadcast();
        let m = Module::new(ModuleMetadata::new("announcer"), Arc::new(Announcer), &services);
        m.load().await.unwrap();

        m.start().await.unwrap();
        assert!(services.events.is_registered("announcer.session"));
        m.stop().await.unwrap();
        assert!(services.events.is_registered("announcer.loud"));
        assert!(!services.events.is_registered("announcer.session"));

        m.start().await.unwrap();
        let descriptor = services.events.event("announcer.loud").unwrap();
        assert!(descriptor.options.broadcast);
        assert_eq!(descriptor.registrants, vec!["announcer".to_string()]);
        assert_eq!(rx.recv().await.unwrap().name, "announcer.loud");
        assert_eq!(rx.recv().await.unwrap().name, "announcer.loud");
        assert!(services.events.is_registered("announcer.session"));
    }
}
