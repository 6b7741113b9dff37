//! External collaborator abstractions.
//!
//! The pipeline treats the container builder, the registry pusher, and the
//! release engine as black boxes: each is invoked once per stage, streams
//! log lines back over a channel, and reports success or failure. The daemon
//! ships exec-based implementations; tests use in-memory mocks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Channel on which a delegate streams human-readable log lines while it runs.
/// Each line becomes one Progress summary and one line of the persisted log.
pub type LogSender = mpsc::Sender<String>;

/// Builds a container image from a gzip'd tar build context.
#[async_trait]
pub trait ContainerBuilder: Send + Sync {
    /// Build `archive` into an image tagged `image_ref`.
    async fn build_image(&self, archive: &[u8], image_ref: &str, logs: LogSender) -> Result<()>;
}

/// Pushes a built image to its registry.
#[async_trait]
pub trait RegistryPusher: Send + Sync {
    /// Push `image_ref` using the given authorization material.
    async fn push_image(&self, image_ref: &str, auth: &str, logs: LogSender) -> Result<()>;
}

/// Installs or upgrades a packaged chart into the cluster.
#[async_trait]
pub trait ReleaseEngine: Send + Sync {
    /// Release `chart` with `values_yaml` into `namespace`, returning the
    /// release name. With `wait` set, the call blocks until the deployment
    /// reports ready.
    async fn release(
        &self,
        app_name: &str,
        namespace: &str,
        chart: &[u8],
        values_yaml: &str,
        wait: bool,
        logs: LogSender,
    ) -> Result<String>;
}
