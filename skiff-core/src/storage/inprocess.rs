//! In-process build record storage.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Result, SkiffError};
use crate::storage::Store;
use crate::types::BuildRecord;

/// An in-memory storage engine mapping application names to build histories.
///
/// The map is guarded by an RwLock so concurrent pipeline completions can
/// append without lost updates.
#[derive(Default)]
pub struct InprocessStore {
    builds: RwLock<HashMap<String, Vec<BuildRecord>>>,
}

impl InprocessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InprocessStore {
    async fn create_build(&self, app_name: &str, record: &BuildRecord) -> Result<()> {
        let mut builds = self.builds.write().await;
        builds.entry(app_name.to_string()).or_default().push(record.clone());
        Ok(())
    }

    async fn update_build(&self, app_name: &str, record: &BuildRecord) -> Result<()> {
        let mut builds = self.builds.write().await;
        let history = builds
            .get_mut(app_name)
            .ok_or_else(|| SkiffError::AppNotFound { app: app_name.to_string() })?;
        let slot = history
            .iter_mut()
            .find(|r| r.build_id == record.build_id)
            .ok_or_else(|| SkiffError::BuildNotFound {
                app: app_name.to_string(),
                build_id: record.build_id.clone(),
            })?;
        *slot = record.clone();
        Ok(())
    }

    async fn get_build(&self, app_name: &str, build_id: &str) -> Result<BuildRecord> {
        let builds = self.builds.read().await;
        let history = builds
            .get(app_name)
            .ok_or_else(|| SkiffError::AppNotFound { app: app_name.to_string() })?;
        history
            .iter()
            .find(|r| r.build_id == build_id)
            .cloned()
            .ok_or_else(|| SkiffError::BuildNotFound {
                app: app_name.to_string(),
                build_id: build_id.to_string(),
            })
    }

    async fn get_builds(&self, app_name: &str) -> Result<Vec<BuildRecord>> {
        let builds = self.builds.read().await;
        builds
            .get(app_name)
            .cloned()
            .ok_or_else(|| SkiffError::AppNotFound { app: app_name.to_string() })
    }

    async fn delete_build(&self, app_name: &str, build_id: &str) -> Result<BuildRecord> {
        let mut builds = self.builds.write().await;
        let history = builds
            .get_mut(app_name)
            .ok_or_else(|| SkiffError::AppNotFound { app: app_name.to_string() })?;
        let idx = history
            .iter()
            .position(|r| r.build_id == build_id)
            .ok_or_else(|| SkiffError::BuildNotFound {
                app: app_name.to_string(),
                build_id: build_id.to_string(),
            })?;
        Ok(history.remove(idx))
    }

    async fn delete_builds(&self, app_name: &str) -> Result<Vec<BuildRecord>> {
        let mut builds = self.builds.write().await;
        builds
            .remove(app_name)
            .ok_or_else(|| SkiffError::AppNotFound { app: app_name.to_string() })
    }
}
