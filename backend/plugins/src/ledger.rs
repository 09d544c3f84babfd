//! Resource Ledger
//!
//! Per-module bookkeeping of everything that must be torn down when the
//! module stops: timers, listeners, observers and arbitrary unsubscribe
//! callbacks. Release is best-effort and in registration order; one failing
//! release never leaks the rest.

use std::fmt;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Something that watches host state and must be disconnected.
pub trait Observer: Send {
    fn disconnect(&mut self) -> anyhow::Result<()>;
}

pub type Detach = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A disposable handle owned by exactly one module.
pub enum Resource {
    /// A spawned interval, timeout, or background task. Released by abort.
    Timer(JoinHandle<()>),
    /// A handler attached to `event` on `target`; `detach` removes it.
    Listener { target: String, event: String, detach: Detach },
    Observer(Box<dyn Observer>),
    /// Invoked once on release.
    Unsubscribe(Detach),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timer(_) => "timer",
            Self::Listener { .. } => "listener",
            Self::Observer(_) => "observer",
            Self::Unsubscribe(_) => "unsubscribe",
        }
    }

    fn release(self) -> anyhow::Result<()> {
        match self {
            Self::Timer(handle) => {
                handle.abort();
                Ok(())
            }
            Self::Listener { detach, .. } => detach(),
            Self::Observer(mut observer) => observer.disconnect(),
            Self::Unsubscribe(f) => f(),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener { target, event, .. } => {
                write!(f, "Resource::Listener({target}:{event})")
            }
            other => write!(f, "Resource::{}", other.kind()),
        }
    }
}

/// Opaque id returned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

impl ResourceId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Outcome of releasing a whole ledger.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<(ResourceId, Resource)>,
    next_id: u64,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: Resource) -> ResourceId {
        self.next_id += 1;
        let id = ResourceId(self.next_id);
        self.entries.push((id, resource));
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove a handle without releasing it.
    pub fn take(&mut self, id: ResourceId) -> Option<Resource> {
        let pos = self.entries.iter().position(|(rid, _)| *rid == id)?;
        Some(self.entries.remove(pos).1)
    }

    /// Move every entry into a new ledger, keeping the id sequence here so
    /// ids handed out earlier are never reused.
    pub fn drain(&mut self) -> ResourceLedger {
        ResourceLedger { entries: std::mem::take(&mut self.entries), next_id: self.next_id }
    }

    /// Release one handle early. Unknown or already released ids are a no-op.
    pub fn release(&mut self, module: &str, id: ResourceId) -> bool {
        match self.take(id) {
            Some(resource) => {
                release_logged(module, id, resource);
                true
            }
            None => false,
        }
    }

    /// Release every handle in registration order and leave the ledger empty.
    pub fn release_all(&mut self, module: &str) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for (id, resource) in self.entries.drain(..) {
            if release_logged(module, id, resource) {
                report.released += 1;
            } else {
                report.failed += 1;
            }
        }
        debug!(module, released = report.released, failed = report.failed, "Released resources");
        report
    }
}

pub(crate) fn release_logged(module: &str, id: ResourceId, resource: Resource) -> bool {
    let kind = resource.kind();
    match resource.release() {
        Ok(()) => true,
        Err(e) => {
            warn!(module, resource = %id, kind, error = %e, "Failed to release resource");
            false
        }
    }
}
