//! Config defaults: applies the runtime default values to a parsed config.

use crate::schema::{DependencyConfig, EventsConfig, FetchConfig, LoggingConfig, ModHostConfig};

/// Additional fetch attempts after the first failure.
pub const DEFAULT_FETCH_MAX_RETRIES: u32 = 3;

pub const DEFAULT_FETCH_RETRY_DELAY_MS: u64 = 500;

pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;

pub const DEFAULT_USER_AGENT: &str = concat!("modhost/", env!("CARGO_PKG_VERSION"));

/// Wait window for a required dependency to reach `started`.
pub const DEFAULT_REQUIRED_TIMEOUT_MS: u64 = 10_000;

/// Wait window for an optional dependency.
pub const DEFAULT_OPTIONAL_TIMEOUT_MS: u64 = 2_000;

pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(config: ModHostConfig) -> ModHostConfig {
    let config = apply_fetch_defaults(config);
    let config = apply_dependency_defaults(config);
    let config = apply_event_defaults(config);
    apply_logging_defaults(config)
}

fn apply_fetch_defaults(mut config: ModHostConfig) -> ModHostConfig {
    let fetch = config.fetch.get_or_insert_with(FetchConfig::default);
    fetch.max_retries.get_or_insert(DEFAULT_FETCH_MAX_RETRIES);
    fetch.retry_delay_ms.get_or_insert(DEFAULT_FETCH_RETRY_DELAY_MS);
    fetch.timeout_ms.get_or_insert(DEFAULT_FETCH_TIMEOUT_MS);
    if fetch.user_agent.is_none() {
        fetch.user_agent = Some(DEFAULT_USER_AGENT.to_string());
    }
    config
}

fn apply_dependency_defaults(mut config: ModHostConfig) -> ModHostConfig {
    let deps = config.dependencies.get_or_insert_with(DependencyConfig::default);
    deps.required_timeout_ms.get_or_insert(DEFAULT_REQUIRED_TIMEOUT_MS);
    deps.optional_timeout_ms.get_or_insert(DEFAULT_OPTIONAL_TIMEOUT_MS);
    config
}

fn apply_event_defaults(mut config: ModHostConfig) -> ModHostConfig {
    let events = config.events.get_or_insert_with(EventsConfig::default);
    events.broadcast_capacity.get_or_insert(DEFAULT_BROADCAST_CAPACITY);
    config
}

fn apply_logging_defaults(mut config: ModHostConfig) -> ModHostConfig {
    let logging = config.logging.get_or_insert_with(LoggingConfig::default);
    if logging.level.is_none() {
        logging.level = Some(DEFAULT_LOG_LEVEL.to_string());
    }
    config
}
