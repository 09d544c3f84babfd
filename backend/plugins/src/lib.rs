//! Module loading and lifecycle orchestration.
//!
//! URLs are fetched concurrently, evaluated one at a time by a
//! [`ScriptEngine`], attributed through the engine's bootstrap slot, and
//! registered as [`Module`]s. The [`StartSequencer`] starts modules once
//! their dependencies are running; stopping a module releases everything
//! recorded in its resource ledger.

pub mod context;
pub mod engine;
pub mod fetch;
pub mod ledger;
pub mod lifecycle;
pub mod loader;
#[cfg(feature = "lua")]
pub mod lua;
pub mod module;
pub mod orchestrator;
pub mod registry;
pub mod sequencer;
pub mod settings;

pub use context::{ModuleContext, ModuleServices};
pub use engine::{BootstrapSlot, ModuleDefinition, ModuleFactory, NativeEngine, ScriptEngine};
pub use fetch::{HttpFetcher, RetryPolicy, fetch_with_retry};
pub use ledger::{Observer, ReleaseReport, Resource, ResourceId, ResourceLedger};
pub use lifecycle::{ModuleBehavior, ModuleState, NoopBehavior};
pub use loader::LoadPipeline;
#[cfg(feature = "lua")]
pub use lua::LuaEngine;
pub use module::{Module, ModuleSummary};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, global};
pub use registry::ModuleRegistry;
pub use sequencer::{DependencyWindows, StartReport, StartSequencer};
pub use settings::{ModuleSettings, SettingDefinition, SettingKind};
