//! The `skiff.toml` application manifest.
//!
//! One manifest holds named environments; `skiff up` picks one (default
//! "development") to decide the target namespace, value overrides, and watch
//! behavior.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const MANIFEST_FILE: &str = "skiff.toml";
pub const DEFAULT_ENVIRONMENT: &str = "development";

const DEFAULT_WATCH_DELAY_SECS: u64 = 2;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub environments: BTreeMap<String, Environment>,
}

/// Settings for one deployment target.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Environment {
    /// Application name; defaults to the app directory name
    pub name: Option<String>,

    /// Target namespace for the release
    pub namespace: String,

    /// Value overrides in `path=value` form, applied over chart defaults
    pub set: Vec<String>,

    /// Block until the release reports ready
    pub wait: bool,

    /// Re-deploy on local file changes
    pub watch: bool,

    /// Seconds of settle time between a file change and the re-deploy
    pub watch_delay: u64,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            name: None,
            namespace: "default".to_string(),
            set: Vec::new(),
            wait: false,
            watch: false,
            watch_delay: DEFAULT_WATCH_DELAY_SECS,
        }
    }
}

impl Manifest {
    /// Load the manifest next to the app directory. A missing file is not an
    /// error; every environment then carries defaults.
    pub fn load(app_dir: &Path) -> Result<Self> {
        let path = app_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// The named environment, or its defaults when the manifest doesn't
    /// mention it.
    pub fn environment(&self, name: &str) -> Environment {
        self.environments.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_environments() {
        let manifest: Manifest = toml::from_str(
            r#"
            [environments.development]
            namespace = "dev"
            set = ["replicas=2", "ingress.enabled=true"]
            watch = true
            watch_delay = 5

            [environments.production]
            name = "web"
            namespace = "prod"
            wait = true
            "#,
        )
        .unwrap();

        let dev = manifest.environment("development");
        assert_eq!(dev.namespace, "dev");
        assert_eq!(dev.set, vec!["replicas=2", "ingress.enabled=true"]);
        assert!(dev.watch);
        assert_eq!(dev.watch_delay, 5);

        let prod = manifest.environment("production");
        assert_eq!(prod.name.as_deref(), Some("web"));
        assert!(prod.wait);
        assert!(!prod.watch);
        assert_eq!(prod.watch_delay, DEFAULT_WATCH_DELAY_SECS);
    }

    #[test]
    fn unknown_environment_gets_defaults() {
        let manifest = Manifest::default();
        let env = manifest.environment("staging");
        assert_eq!(env.namespace, "default");
        assert_eq!(env.watch_delay, DEFAULT_WATCH_DELAY_SECS);
        assert!(env.set.is_empty());
    }

    #[test]
    fn missing_manifest_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(dir.path()).unwrap();
        assert!(manifest.environments.is_empty());
    }
}
