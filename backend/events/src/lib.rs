//! Global registry of named module events.

pub mod registry;
pub mod types;

pub use registry::{EventRegistry, Subscription};
pub use types::{BroadcastEvent, EventCallback, EventDescriptor, EventOptions, MODULE_FIELD, WILDCARD};
