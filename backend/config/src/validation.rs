//! Config validation with field paths in every message.

use crate::schema::ModHostConfig;
use thiserror::Error;

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// A collection of validation errors found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError { path: path.into(), message: message.into() });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError { path: path.into(), message: message.into() });
    }
}

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &ModHostConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_fetch(config, &mut report);
    validate_dependencies(config, &mut report);
    validate_sources(config, &mut report);
    report
}

fn validate_fetch(config: &ModHostConfig, report: &mut ValidationReport) {
    let Some(fetch) = &config.fetch else { return };
    if let Some(retries) = fetch.max_retries {
        if retries > 10 {
            report.warn("fetch.maxRetries", format!("{retries} retries will stall startup on a dead host"));
        }
    }
    if fetch.timeout_ms == Some(0) {
        report.error("fetch.timeoutMs", "timeoutMs must be > 0");
    }
}

fn validate_dependencies(config: &ModHostConfig, report: &mut ValidationReport) {
    let Some(deps) = &config.dependencies else { return };
    if deps.required_timeout_ms == Some(0) {
        report.error("dependencies.requiredTimeoutMs", "requiredTimeoutMs must be > 0");
    }
    if let (Some(req), Some(opt)) = (deps.required_timeout_ms, deps.optional_timeout_ms) {
        if opt > req {
            report.warn(
                "dependencies.optionalTimeoutMs",
                "optional dependency wait is longer than the required one",
            );
        }
    }
}

fn validate_sources(config: &ModHostConfig, report: &mut ValidationReport) {
    let lists = [("repositories", &config.repositories), ("modules", &config.modules)];
    for (field, urls) in lists {
        for (i, url) in urls.iter().enumerate() {
            let path = format!("{field}[{i}]");
            if url.trim().is_empty() {
                report.error(path, "URL cannot be empty");
            } else if !(url.starts_with("https://")
                || url.starts_with("http://")
                || url.starts_with("file://"))
            {
                report.error(path, format!("unsupported URL scheme in '{url}'"));
            } else if url.starts_with("http://") {
                report.warn(path, "module code fetched over plain http");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::apply_all_defaults;
    use crate::schema::DependencyConfig;

    #[test]
    fn defaults_are_valid() {
        let report = validate(&apply_all_defaults(ModHostConfig::default()));
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn rejects_zero_required_timeout() {
        let config = ModHostConfig {
            dependencies: Some(DependencyConfig {
                required_timeout_ms: Some(0),
                optional_timeout_ms: Some(2000),
            }),
            ..Default::default()
        };
        let report = validate(&config);
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].path, "dependencies.requiredTimeoutMs");
    }

    #[test]
    fn flags_bad_and_insecure_urls() {
        let config = ModHostConfig {
            modules: vec!["ftp://x/a.lua".into(), "http://x/b.lua".into()],
            ..Default::default()
        };
        let report = validate(&config);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].path, "modules[1]");
    }
}
