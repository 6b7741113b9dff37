//! Client-side configuration.
//!
//! A flat string map persisted at `$SKIFF_HOME/config.toml` (default
//! `~/.skiff/config.toml`). Holds things like the daemon address under the
//! "server" key.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const SERVER_KEY: &str = "server";
pub const DEFAULT_SERVER: &str = "127.0.0.1:44134";

/// The skiff home directory: `$SKIFF_HOME`, falling back to `~/.skiff`.
pub fn skiff_home() -> PathBuf {
    if let Ok(home) = std::env::var("SKIFF_HOME") {
        return PathBuf::from(home);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".skiff")
}

#[derive(Debug, Default)]
pub struct Config {
    entries: BTreeMap<String, String>,
    path: PathBuf,
}

impl Config {
    /// Load the config map, creating an empty one when the file is missing.
    pub fn load() -> Result<Self> {
        Self::load_from(skiff_home().join("config.toml"))
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { entries, path })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    /// Remove a key, returning whether it existed.
    pub fn unset(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Write the map back to disk, creating the parent directory if needed.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = toml::to_string(&self.entries).context("failed to serialize config")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// The daemon address: explicit flag, then config, then the default.
    pub fn server_addr(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| self.get(SERVER_KEY).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_SERVER.to_string())
    }
}
