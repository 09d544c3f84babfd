//! Environment handling for config values.
//!
//! Two passes run at load time:
//! - `${VAR_NAME}` references inside string values are substituted
//!   (uppercase `[A-Z_][A-Z0-9_]*` names only; `$${VAR}` escapes to `${VAR}`),
//!   so repository URLs can carry tokens without committing them.
//! - `MODHOST_*` variables override individual fields.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;

use crate::schema::ModHostConfig;

/// Matches `$${VAR}` (escaped) and `${VAR}` (reference) in one pass.
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$?)\$\{([A-Z_][A-Z0-9_]*)\}").unwrap());

/// Error returned for missing env vars.
#[derive(Debug, thiserror::Error)]
#[error("Missing env var \"{var_name}\" referenced at config path: {config_path}")]
pub struct MissingEnvVarError {
    pub var_name: String,
    pub config_path: String,
}

/// Substitute `${VAR}` references using the process environment.
pub fn resolve_env_vars(value: &Value) -> Result<Value> {
    resolve_env_vars_with(value, &std::env::vars().collect())
}

/// Substitute `${VAR}` references using a provided map.
pub fn resolve_env_vars_with(value: &Value, env: &HashMap<String, String>) -> Result<Value> {
    Ok(substitute_value(value, env, "")?)
}

fn substitute_value(
    value: &Value,
    env: &HashMap<String, String>,
    path: &str,
) -> Result<Value, MissingEnvVarError> {
    match value {
        Value::String(s) => Ok(Value::String(substitute_string(s, env, path)?)),
        Value::Array(arr) => arr
            .iter()
            .enumerate()
            .map(|(i, v)| substitute_value(v, env, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut result = serde_json::Map::new();
            for (k, v) in map {
                let child_path = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                result.insert(k.clone(), substitute_value(v, env, &child_path)?);
            }
            Ok(Value::Object(result))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_string(
    s: &str,
    env: &HashMap<String, String>,
    path: &str,
) -> Result<String, MissingEnvVarError> {
    if !s.contains('$') {
        return Ok(s.to_string());
    }

    let mut missing: Option<MissingEnvVarError> = None;
    let out = ENV_VAR_PATTERN.replace_all(s, |caps: &Captures| {
        let name = &caps[2];
        if !caps[1].is_empty() {
            return format!("${{{name}}}");
        }
        match env.get(name) {
            Some(val) if !val.is_empty() => val.clone(),
            _ => {
                missing.get_or_insert_with(|| MissingEnvVarError {
                    var_name: name.to_string(),
                    config_path: path.to_string(),
                });
                String::new()
            }
        }
    });

    match missing {
        Some(err) => Err(err),
        None => Ok(out.into_owned()),
    }
}

/// Apply `MODHOST_*` overrides from the process environment.
pub fn apply_env_overrides(config: ModHostConfig) -> ModHostConfig {
    apply_env_overrides_with(config, &std::env::vars().collect())
}

/// Apply `MODHOST_*` overrides from a provided map.
///
/// Unparseable numeric values are ignored with a warning.
pub fn apply_env_overrides_with(
    mut config: ModHostConfig,
    env: &HashMap<String, String>,
) -> ModHostConfig {
    if let Some(v) = parse_var::<u32>(env, "MODHOST_FETCH_MAX_RETRIES") {
        config.fetch.get_or_insert_with(Default::default).max_retries = Some(v);
    }
    if let Some(v) = parse_var::<u64>(env, "MODHOST_FETCH_RETRY_DELAY_MS") {
        config.fetch.get_or_insert_with(Default::default).retry_delay_ms = Some(v);
    }
    if let Some(v) = parse_var::<u64>(env, "MODHOST_REQUIRED_TIMEOUT_MS") {
        config.dependencies.get_or_insert_with(Default::default).required_timeout_ms = Some(v);
    }
    if let Some(v) = parse_var::<u64>(env, "MODHOST_OPTIONAL_TIMEOUT_MS") {
        config.dependencies.get_or_insert_with(Default::default).optional_timeout_ms = Some(v);
    }
    if let Some(level) = env.get("MODHOST_LOG").filter(|v| !v.is_empty()) {
        config.logging.get_or_insert_with(Default::default).level = Some(level.clone());
    }
    if let Some(dir) = env.get("MODHOST_LOG_DIR").filter(|v| !v.is_empty()) {
        config.logging.get_or_insert_with(Default::default).dir = Some(dir.clone());
    }
    if let Some(repos) = env.get("MODHOST_REPOSITORIES") {
        config.repositories.extend(
            repos.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from),
        );
    }
    config
}

fn parse_var<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = env.get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = key, value = %raw, "Ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_reference_in_url() {
        let v = json!({"repositories": ["https://mods.example.com/repo.json?token=${REPO_TOKEN}"]});
        let result = resolve_env_vars_with(&v, &env(&[("REPO_TOKEN", "abc")])).unwrap();
        assert_eq!(result["repositories"][0], "https://mods.example.com/repo.json?token=abc");
    }

    #[test]
    fn escaped_reference_is_kept_literally() {
        let v = json!({"key": "$${NOT_A_VAR}"});
        let result = resolve_env_vars_with(&v, &HashMap::new()).unwrap();
        assert_eq!(result["key"], "${NOT_A_VAR}");
    }

    #[test]
    fn error_names_missing_var_and_path() {
        let v = json!({"fetch": {"userAgent": "${MISSING_VAR}"}});
        let err = resolve_env_vars_with(&v, &HashMap::new()).unwrap_err().to_string();
        assert!(err.contains("MISSING_VAR"));
        assert!(err.contains("fetch.userAgent"));
    }

    #[test]
    fn overrides_apply_to_empty_config() {
        let config = apply_env_overrides_with(
            ModHostConfig::default(),
            &env(&[
                ("MODHOST_FETCH_MAX_RETRIES", "5"),
                ("MODHOST_REQUIRED_TIMEOUT_MS", "oops"),
                ("MODHOST_REPOSITORIES", "https://a/repo.json, https://b/repo.json"),
            ]),
        );
        assert_eq!(config.fetch().max_retries, Some(5));
        assert_eq!(config.dependencies().required_timeout_ms, None);
        assert_eq!(config.repositories.len(), 2);
    }
}
