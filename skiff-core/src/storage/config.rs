//! Config-object backed build record storage.
//!
//! Stores each application's history inside one named configuration object
//! (the shape a cluster exposes for small key/value payloads). Writes go
//! through read-modify-write with version-checked replacement; a lost race
//! is retried once before surfacing a conflict. Records are serialized as
//! JSON strings in the object's data map, keyed by build ID.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{Result, SkiffError};
use crate::storage::Store;
use crate::types::BuildRecord;

/// A versioned key/value configuration object.
#[derive(Debug, Clone, Default)]
pub struct ConfigObject {
    /// Backend revision used for compare-and-swap on replace
    pub version: u64,
    /// Build ID -> serialized record
    pub data: BTreeMap<String, String>,
}

/// The slice of a cluster config API the store needs.
///
/// `replace` must fail with `StorageConflict` when `expected_version` no
/// longer matches the stored object, and with `AppNotFound` when the object
/// does not exist.
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    async fn get(&self, name: &str) -> Result<ConfigObject>;
    async fn create(&self, name: &str, object: ConfigObject) -> Result<()>;
    async fn replace(&self, name: &str, expected_version: u64, object: ConfigObject)
        -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Build record store backed by a [`ConfigBackend`].
pub struct ConfigStore<B> {
    backend: B,
}

impl<B: ConfigBackend> ConfigStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Read-modify-write the application's object, retrying a version
    /// conflict once before giving up.
    async fn mutate<F>(&self, app_name: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut ConfigObject) -> Result<()>,
    {
        let mut attempts = 0;
        loop {
            let mut object = match self.backend.get(app_name).await {
                Ok(object) => object,
                Err(err) if err.is_not_found() => {
                    let mut object = ConfigObject::default();
                    mutate(&mut object)?;
                    return self.backend.create(app_name, object).await;
                }
                Err(err) => return Err(err),
            };
            let expected = object.version;
            mutate(&mut object)?;
            match self.backend.replace(app_name, expected, object).await {
                Err(SkiffError::StorageConflict { app }) if attempts == 0 => {
                    warn!(app = %app, "config object write conflict, retrying once");
                    attempts += 1;
                }
                other => return other,
            }
        }
    }
}

fn encode(record: &BuildRecord) -> Result<String> {
    serde_json::to_string(record).map_err(|e| SkiffError::Internal(e.to_string()))
}

fn decode(app: &str, raw: &str) -> Result<BuildRecord> {
    serde_json::from_str(raw).map_err(|e| SkiffError::StorageUnavailable {
        reason: format!("corrupt record for application {:?}: {}", app, e),
    })
}

#[async_trait]
impl<B: ConfigBackend> Store for ConfigStore<B> {
    async fn create_build(&self, app_name: &str, record: &BuildRecord) -> Result<()> {
        let encoded = encode(record)?;
        let build_id = record.build_id.clone();
        self.mutate(app_name, move |object| {
            object.data.insert(build_id.clone(), encoded.clone());
            Ok(())
        })
        .await
    }

    async fn update_build(&self, app_name: &str, record: &BuildRecord) -> Result<()> {
        let encoded = encode(record)?;
        let build_id = record.build_id.clone();
        let app = app_name.to_string();
        self.mutate(app_name, move |object| {
            if !object.data.contains_key(&build_id) {
                return Err(SkiffError::BuildNotFound {
                    app: app.clone(),
                    build_id: build_id.clone(),
                });
            }
            object.data.insert(build_id.clone(), encoded.clone());
            Ok(())
        })
        .await
    }

    async fn get_build(&self, app_name: &str, build_id: &str) -> Result<BuildRecord> {
        let object = self.backend.get(app_name).await?;
        match object.data.get(build_id) {
            Some(raw) => decode(app_name, raw),
            None => Err(SkiffError::BuildNotFound {
                app: app_name.to_string(),
                build_id: build_id.to_string(),
            }),
        }
    }

    async fn get_builds(&self, app_name: &str) -> Result<Vec<BuildRecord>> {
        let object = self.backend.get(app_name).await?;
        object.data.values().map(|raw| decode(app_name, raw)).collect()
    }

    async fn delete_build(&self, app_name: &str, build_id: &str) -> Result<BuildRecord> {
        let record = self.get_build(app_name, build_id).await?;
        let build_id = build_id.to_string();
        self.mutate(app_name, move |object| {
            object.data.remove(&build_id);
            Ok(())
        })
        .await?;
        Ok(record)
    }

    async fn delete_builds(&self, app_name: &str) -> Result<Vec<BuildRecord>> {
        let records = self.get_builds(app_name).await?;
        self.backend.delete(app_name).await?;
        Ok(records)
    }
}
