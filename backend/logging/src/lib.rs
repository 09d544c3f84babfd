//! Structured logging for modhost.
//!
//! Console + rolling NDJSON file output, URL redaction, and typed module
//! lifecycle events.

pub mod event_logger;
pub mod logger;
pub mod redact;

pub use event_logger::{LifecycleLogger, ModuleEvent, ModuleEventEntry};
pub use logger::{init_logger, LogGuard};
pub use redact::redact_url;
