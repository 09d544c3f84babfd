pub mod host;
pub mod registry;
pub mod types;

pub use host::{HostFn, HostFunctions};
pub use registry::HookTable;
pub use types::{HookCallback, HookKind, HookRecord, PostHook, PreHook, ReplaceHook, VoidHook};
