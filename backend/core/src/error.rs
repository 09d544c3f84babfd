use thiserror::Error;

/// Failure retrieving a module script or repository document.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Failure turning a URL into a module instance.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// Retries exhausted. The URL is added to the failure set.
    #[error("fetch failed for {url} after {attempts} attempt(s): {source}")]
    Fetch {
        url: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    /// The script ran but left nothing usable in the bootstrap slot.
    #[error("script at {url} did not define a module: {reason}")]
    Attribution { url: String, reason: String },

    /// The URL failed earlier in this session and will not be retried.
    #[error("{0} previously failed to load; not retrying this session")]
    CircuitOpen(String),
}

impl LoadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { .. })
    }
}

/// Hook table registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("a replace hook is already active on '{path}' (owned by {owner})")]
    Conflict { path: String, owner: String },

    #[error("no host function is registered at '{0}'")]
    UnknownPath(String),
}

/// A dependency never reached the started state within its wait window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTimeout {
    pub module: String,
    pub dependency: String,
    pub required: bool,
    pub waited_ms: u64,
}

impl std::fmt::Display for DependencyTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.required { "required" } else { "optional" };
        write!(
            f,
            "{}: {} dependency '{}' not started after {}ms",
            self.module, kind, self.dependency, self.waited_ms
        )
    }
}

impl std::error::Error for DependencyTimeout {}

/// The lifecycle method that raised a [`LifecycleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Load,
    Start,
    Stop,
    Login,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Load => "load",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Login => "on_login",
        };
        f.write_str(s)
    }
}

/// An error raised from inside a module's own lifecycle method.
#[derive(Debug, Clone, Error)]
#[error("module '{module}' failed during {phase}: {message}")]
pub struct LifecycleError {
    pub module: String,
    pub phase: LifecyclePhase,
    pub message: String,
}

/// Rejected writes through a module settings store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("unknown setting '{0}'")]
    UnknownKey(String),

    #[error("setting '{key}' expects {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("'{value}' is not an allowed option for '{key}'")]
    InvalidOption { key: String, value: String },

    #[error("settings backend refused to persist '{0}'")]
    PersistFailed(String),
}

/// Top-level error type for the orchestrator.
#[derive(Debug, Error)]
pub enum ModHostError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Dependency(#[from] DependencyTimeout),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_timeout_message_names_kind() {
        let err = DependencyTimeout {
            module: "b".into(),
            dependency: "a".into(),
            required: true,
            waited_ms: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "b: required dependency 'a' not started after 10000ms"
        );
    }

    #[test]
    fn only_fetch_failures_are_retryable() {
        let fetch = LoadError::Fetch {
            url: "u".into(),
            attempts: 1,
            source: FetchError::Status { url: "u".into(), status: 503 },
        };
        assert!(fetch.is_retryable());
        assert!(!LoadError::Attribution { url: "u".into(), reason: "empty".into() }.is_retryable());
        assert!(!LoadError::CircuitOpen("u".into()).is_retryable());
    }
}
