//! Client configuration
//!
//! [`ClientConfig`] describes one language server: how to launch it, which
//! language ids it serves, and whether it is enabled. Loaded configs are
//! immutable; the [`ConfigStore`] layers global and per-workspace
//! enable/disable overrides on top and hands out resolved copies.
//! Persisting overrides is the embedding shell's job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command line used to launch a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Static description of one language server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Unique name, e.g. "rust-analyzer".
    pub name: String,

    pub command: LaunchCommand,

    /// Language ids this server handles, e.g. `["rust"]`.
    #[serde(default)]
    pub languages: Vec<String>,

    /// Passed through verbatim as `initializationOptions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<Value>,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, command: LaunchCommand) -> Self {
        Self {
            name: name.into(),
            command,
            languages: Vec::new(),
            initialization_options: None,
            enabled: defaults::enabled(),
        }
    }

    pub fn language(mut self, language_id: impl Into<String>) -> Self {
        self.languages.push(language_id.into());
        self
    }

    pub fn matches(&self, language_id: &str) -> bool {
        self.languages.iter().any(|l| l == language_id)
    }
}

mod defaults {
    pub fn enabled() -> bool {
        true
    }
}

#[derive(Default)]
struct StoreInner {
    configs: Vec<ClientConfig>,
    /// name → enabled override, all workspaces.
    global: HashMap<String, bool>,
    /// workspace root → name → enabled override.
    project: HashMap<PathBuf, HashMap<String, bool>>,
}

impl StoreInner {
    fn is_enabled(&self, root: &Path, config: &ClientConfig) -> bool {
        if let Some(overrides) = self.project.get(root)
            && let Some(enabled) = overrides.get(&config.name)
        {
            return *enabled;
        }
        if let Some(enabled) = self.global.get(&config.name) {
            return *enabled;
        }
        config.enabled
    }
}

/// Registry of known server configs with scoped enablement.
///
/// Override precedence: per-workspace, then global, then the config's own
/// `enabled` flag.
pub struct ConfigStore {
    inner: RwLock<StoreInner>,
}

impl ConfigStore {
    pub fn new(configs: Vec<ClientConfig>) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                configs,
                ..Default::default()
            }),
        }
    }

    /// Enable a server for all workspaces.
    pub fn enable(&self, name: &str) {
        let mut inner = self.inner.write().expect("config store poisoned");
        inner.global.insert(name.to_string(), true);
    }

    /// Disable a server for all workspaces.
    pub fn disable(&self, name: &str) {
        let mut inner = self.inner.write().expect("config store poisoned");
        inner.global.insert(name.to_string(), false);
    }

    /// Enable a server for one workspace only.
    pub fn enable_in_project(&self, root: &Path, name: &str) {
        let mut inner = self.inner.write().expect("config store poisoned");
        inner
            .project
            .entry(root.to_path_buf())
            .or_default()
            .insert(name.to_string(), true);
    }

    /// Disable a server for one workspace only.
    pub fn disable_in_project(&self, root: &Path, name: &str) {
        let mut inner = self.inner.write().expect("config store poisoned");
        inner
            .project
            .entry(root.to_path_buf())
            .or_default()
            .insert(name.to_string(), false);
    }

    /// Drop all per-workspace overrides for a root, used when the
    /// workspace closes.
    pub fn forget_project(&self, root: &Path) {
        let mut inner = self.inner.write().expect("config store poisoned");
        inner.project.remove(root);
    }

    /// All configs with their effective enablement for a workspace.
    pub fn effective(&self, root: &Path) -> Vec<ClientConfig> {
        let inner = self.inner.read().expect("config store poisoned");
        inner
            .configs
            .iter()
            .map(|c| {
                let mut resolved = c.clone();
                resolved.enabled = inner.is_enabled(root, c);
                resolved
            })
            .collect()
    }

    /// The enabled config serving a language in a workspace, if any.
    pub fn config_for(&self, root: &Path, language_id: &str) -> Option<ClientConfig> {
        let inner = self.inner.read().expect("config store poisoned");
        inner
            .configs
            .iter()
            .find(|c| c.matches(language_id) && inner.is_enabled(root, c))
            .map(|c| {
                let mut resolved = c.clone();
                resolved.enabled = true;
                resolved
            })
    }

    /// A config serving a language regardless of enablement. This is what
    /// a setup flow offers to enable when `config_for` comes up empty.
    pub fn default_config_for(&self, root: &Path, language_id: &str) -> Option<ClientConfig> {
        let inner = self.inner.read().expect("config store poisoned");
        inner.configs.iter().find(|c| c.matches(language_id)).map(|c| {
            let mut resolved = c.clone();
            resolved.enabled = inner.is_enabled(root, c);
            resolved
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::new(vec![
            ClientConfig::new("rust-analyzer", LaunchCommand::new("rust-analyzer"))
                .language("rust"),
            ClientConfig {
                enabled: false,
                ..ClientConfig::new(
                    "pyright",
                    LaunchCommand::new("pyright-langserver").arg("--stdio"),
                )
                .language("python")
            },
        ])
    }

    #[test]
    fn test_enabled_config_resolves() {
        let store = store();
        let root = Path::new("/work/project");

        let config = store.config_for(root, "rust").unwrap();
        assert_eq!(config.name, "rust-analyzer");
        assert!(config.enabled);

        // pyright ships disabled
        assert!(store.config_for(root, "python").is_none());
        assert_eq!(
            store.default_config_for(root, "python").unwrap().name,
            "pyright"
        );
    }

    #[test]
    fn test_global_enable_disable() {
        let store = store();
        let root = Path::new("/work/project");

        store.enable("pyright");
        assert!(store.config_for(root, "python").is_some());

        store.disable("rust-analyzer");
        assert!(store.config_for(root, "rust").is_none());
    }

    #[test]
    fn test_project_override_wins_over_global() {
        let store = store();
        let a = Path::new("/work/a");
        let b = Path::new("/work/b");

        store.disable("rust-analyzer");
        store.enable_in_project(a, "rust-analyzer");

        assert!(store.config_for(a, "rust").is_some());
        assert!(store.config_for(b, "rust").is_none());
    }

    #[test]
    fn test_forget_project_restores_global() {
        let store = store();
        let root = Path::new("/work/project");

        store.disable_in_project(root, "rust-analyzer");
        assert!(store.config_for(root, "rust").is_none());

        store.forget_project(root);
        assert!(store.config_for(root, "rust").is_some());
    }

    #[test]
    fn test_effective_reports_resolved_flags() {
        let store = store();
        let root = Path::new("/work/project");
        store.enable("pyright");

        let effective = store.effective(root);
        assert!(effective.iter().all(|c| c.enabled));
    }

    #[test]
    fn test_unknown_language_has_no_config() {
        let store = store();
        let root = Path::new("/work/project");
        assert!(store.config_for(root, "cobol").is_none());
        assert!(store.default_config_for(root, "cobol").is_none());
    }
}
