use serde::{Deserialize, Serialize};

/// Declarative description of a module, as embedded in its script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Stable identifier. Derived from the source URL when left empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Module ids that must be started before this one may start.
    #[serde(default)]
    pub required: Vec<String>,
    /// Module ids this one will use when present.
    #[serde(default)]
    pub optional: Vec<String>,
    /// Source URL, filled in by the loader during attribution.
    #[serde(default)]
    pub url: Option<String>,
}

impl ModuleMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self { name: id.clone(), id, ..Default::default() }
    }

    pub fn requires(mut self, dep: impl Into<String>) -> Self {
        self.required.push(dep.into());
        self
    }

    pub fn optionally(mut self, dep: impl Into<String>) -> Self {
        self.optional.push(dep.into());
        self
    }

    /// Fill in the source URL and, if absent, the id and name.
    pub fn attribute(&mut self, url: &str) {
        self.url = Some(url.to_string());
        if self.id.trim().is_empty() {
            self.id = derive_module_id(url);
        }
        if self.name.trim().is_empty() {
            self.name = self.id.clone();
        }
    }
}

/// Derive a module id from its source URL.
///
/// Takes the last path segment, drops query, fragment and extension, and
/// normalises to lowercase `[a-z0-9_-]`.
pub fn derive_module_id(url: &str) -> String {
    let without_suffix = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    let segment = without_suffix.rsplit('/').next().unwrap_or_default();
    let stem = match segment.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => segment,
    };
    let id: String = stem
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    let id = id.trim_matches('-').to_string();
    if id.is_empty() {
        "module".to_string()
    } else {
        id
    }
}

/// A user-facing action a module exposes (e.g. a menu entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleAction {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Outcome of an orchestration entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self { success: true, message: None }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self { success: true, message: Some(message.into()) }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: Some(message.into()) }
    }
}

/// The authenticated host user handed to `on_login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostUser {
    pub id: String,
    pub display_name: String,
}

/// One remotely hosted module listed in a repository document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A repository document seeding load requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub modules: Vec<RepositoryEntry>,
}

impl RepositoryDescriptor {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let descriptor: Self = serde_json::from_str(raw)?;
        Ok(descriptor)
    }

    /// URLs of the entries that are enabled, in document order.
    pub fn enabled_urls(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.url.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_id_from_last_segment() {
        assert_eq!(derive_module_id("https://cdn.example.com/mods/Auto-Invite.lua"), "auto-invite");
        assert_eq!(derive_module_id("https://x.dev/a/b/friend_notes.lua?v=3#top"), "friend_notes");
        assert_eq!(derive_module_id("https://x.dev/a/b/"), "b");
        assert_eq!(derive_module_id("file:///tmp/My Module.lua"), "my-module");
        assert_eq!(derive_module_id(""), "module");
    }

    #[test]
    fn attribution_keeps_explicit_id() {
        let mut meta = ModuleMetadata::new("explicit");
        meta.attribute("https://x.dev/other.lua");
        assert_eq!(meta.id, "explicit");
        assert_eq!(meta.url.as_deref(), Some("https://x.dev/other.lua"));

        let mut anon = ModuleMetadata::default();
        anon.attribute("https://x.dev/other.lua");
        assert_eq!(anon.id, "other");
        assert_eq!(anon.name, "other");
    }

    #[test]
    fn repository_skips_disabled_entries() {
        let raw = r#"{
            "name": "community",
            "modules": [
                {"id": "a", "url": "https://x.dev/a.lua", "tags": ["social"]},
                {"id": "b", "url": "https://x.dev/b.lua", "enabled": false}
            ]
        }"#;
        let repo = RepositoryDescriptor::parse(raw).unwrap();
        assert_eq!(repo.modules.len(), 2);
        assert_eq!(repo.enabled_urls(), vec!["https://x.dev/a.lua".to_string()]);
    }
}
