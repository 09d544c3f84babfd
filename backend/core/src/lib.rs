pub mod error;
pub mod traits;
pub mod types;

pub use error::{
    DependencyTimeout, FetchError, HookError, LifecycleError, LifecyclePhase, LoadError,
    ModHostError, SettingsError,
};
pub use traits::{
    MemorySettingsStore, Notifier, NotifyLevel, ScriptFetcher, SettingsStore, TracingNotifier,
};
pub use types::{
    derive_module_id, HostUser, ModuleAction, ModuleMetadata, OperationResult,
    RepositoryDescriptor, RepositoryEntry,
};
