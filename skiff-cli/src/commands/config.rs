//! `skiff config`: manage the client configuration map.

use anyhow::Result;

use crate::config::Config;

pub fn get(config: &Config, key: &str) -> Result<()> {
    match config.get(key) {
        Some(value) => {
            println!("{}", value);
            Ok(())
        }
        None => anyhow::bail!("key {:?} is not set", key),
    }
}

pub fn set(config: &mut Config, key: &str, value: &str) -> Result<()> {
    config.set(key, value);
    config.save()
}

pub fn unset(config: &mut Config, key: &str) -> Result<()> {
    if !config.unset(key) {
        anyhow::bail!("key {:?} is not set", key);
    }
    config.save()
}

pub fn list(config: &Config) {
    for (key, value) in config.entries() {
        println!("{}={}", key, value);
    }
}
