//! Module lifecycle: the behavior contract a module implements and the
//! states the orchestrator tracks for it.

use anyhow::Result;
use async_trait::async_trait;
use modhost_core::HostUser;
use serde::{Deserialize, Serialize};

use crate::context::ModuleContext;

/// Where a module is in its lifecycle.
///
/// `Constructed -> Loaded -> Started -> Loaded (stop) -> Started ...`;
/// any failing transition moves to `Failed`, which is terminal until the
/// module is unloaded or reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Constructed,
    Loaded,
    Started,
    Failed,
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Constructed => "constructed",
            Self::Loaded => "loaded",
            Self::Started => "started",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Behavior supplied by a module definition. Every hook is optional.
///
/// `load` runs once per instance and is where settings, actions and events
/// are declared. `start` acquires runtime resources through the context so
/// they are released automatically when the module stops.
#[async_trait]
pub trait ModuleBehavior: Send + Sync {
    async fn load(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// Module-specific teardown. Ledger release happens afterwards regardless.
    async fn stop(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    async fn on_login(&self, _ctx: &ModuleContext, _user: &HostUser) -> Result<()> {
        Ok(())
    }
}

/// A module with no behavior of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBehavior;

#[async_trait]
impl ModuleBehavior for NoopBehavior {}
