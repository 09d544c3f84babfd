/// Hook kinds and callback shapes.
///
/// A hook intercepts one host function, addressed by its dotted path
/// (e.g. `friends.send_invite`). Arguments and results are JSON values.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::host::HostFn;

// ---------------------------------------------------------------------------
// Hook kinds
// ---------------------------------------------------------------------------

/// How a hook interacts with the function it intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Runs before the original with mutable arguments.
    Pre,
    /// Runs after the original and may replace the result.
    Post,
    /// Suppresses the original entirely.
    Void,
    /// Takes over the call; at most one per path.
    Replace,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pre => "pre",
            Self::Post => "post",
            Self::Void => "void",
            Self::Replace => "replace",
        };
        f.write_str(s)
    }
}

impl FromStr for HookKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre" => Ok(Self::Pre),
            "post" => Ok(Self::Post),
            "void" => Ok(Self::Void),
            "replace" | "instead" => Ok(Self::Replace),
            other => anyhow::bail!("unknown hook kind '{other}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

pub type PreHook = Arc<dyn Fn(&mut Vec<Value>) -> anyhow::Result<()> + Send + Sync>;
/// Returns `Some` to replace the result forwarded to later hooks and the caller.
pub type PostHook = Arc<dyn Fn(&Value, &[Value]) -> anyhow::Result<Option<Value>> + Send + Sync>;
pub type VoidHook = Arc<dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync>;
/// Receives the original function and is responsible for calling it.
pub type ReplaceHook = Arc<dyn Fn(&HostFn, &[Value]) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Clone)]
pub enum HookCallback {
    Pre(PreHook),
    Post(PostHook),
    Void(VoidHook),
    Replace(ReplaceHook),
}

impl HookCallback {
    pub fn pre(f: impl Fn(&mut Vec<Value>) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        Self::Pre(Arc::new(f))
    }

    pub fn post(
        f: impl Fn(&Value, &[Value]) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self::Post(Arc::new(f))
    }

    pub fn void(f: impl Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        Self::Void(Arc::new(f))
    }

    pub fn replace(
        f: impl Fn(&HostFn, &[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::Replace(Arc::new(f))
    }

    pub fn kind(&self) -> HookKind {
        match self {
            Self::Pre(_) => HookKind::Pre,
            Self::Post(_) => HookKind::Post,
            Self::Void(_) => HookKind::Void,
            Self::Replace(_) => HookKind::Replace,
        }
    }
}

impl fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HookCallback::{}", self.kind())
    }
}

/// Introspection record for one registered hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRecord {
    pub path: String,
    pub kind: HookKind,
    pub owner: String,
}
