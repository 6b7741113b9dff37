//! Build record storage.
//!
//! Records are scoped by application name and build ID. Two backends ship:
//! an in-process map for tests and single-node daemons, and a config-object
//! backed store that leans on the backend's optimistic concurrency instead
//! of a local lock.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::BuildRecord;

pub mod config;
pub mod inprocess;

pub use config::{ConfigBackend, ConfigObject, ConfigStore};
pub use inprocess::InprocessStore;

/// Persistence contract for build records.
///
/// `get_builds` returns records in the backend's discovery order; callers
/// needing time order sort on the lexically sortable build ID.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a new record for `app_name`. Concurrent creates for the same
    /// application must not lose updates.
    async fn create_build(&self, app_name: &str, record: &BuildRecord) -> Result<()>;

    /// Replace the stored record matching `record.build_id`.
    async fn update_build(&self, app_name: &str, record: &BuildRecord) -> Result<()>;

    /// Fetch one record. Fails with `AppNotFound` when the application has no
    /// history, `BuildNotFound` when the application exists but the ID does not.
    async fn get_build(&self, app_name: &str, build_id: &str) -> Result<BuildRecord>;

    /// Fetch every record for `app_name`.
    async fn get_builds(&self, app_name: &str) -> Result<Vec<BuildRecord>>;

    /// Delete one record, returning it.
    async fn delete_build(&self, app_name: &str, build_id: &str) -> Result<BuildRecord>;

    /// Delete the application's entire history, returning it.
    async fn delete_builds(&self, app_name: &str) -> Result<Vec<BuildRecord>>;
}
