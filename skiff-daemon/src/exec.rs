//! Exec-based delegate implementations.
//!
//! Drives the `docker` and `helm` CLIs as child processes. Each invocation
//! pipes stdout and stderr back line-by-line over the delegate log channel,
//! so every line the tool prints becomes a Progress summary on the wire.
//!
//! Child processes are spawned with `kill_on_drop`, so aborting a stage
//! (client disconnect, shutdown) terminates the underlying tool as well.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

use skiff_core::delegates::{ContainerBuilder, LogSender, RegistryPusher, ReleaseEngine};
use skiff_core::error::{Result, SkiffError};

/// Container builder and pusher backed by the `docker` CLI.
#[derive(Clone)]
pub struct DockerCli {
    binary_path: PathBuf,
}

impl DockerCli {
    /// Create a new docker delegate, auto-detecting the binary location.
    pub fn new() -> Result<Self> {
        let binary_path = find_binary("docker")?;
        Ok(Self { binary_path })
    }

    /// Create a delegate with an explicit docker binary path.
    pub fn with_path(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }
}

#[async_trait]
impl ContainerBuilder for DockerCli {
    async fn build_image(&self, archive: &[u8], image_ref: &str, logs: LogSender) -> Result<()> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("build").arg("--tag").arg(image_ref).arg("-");
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SkiffError::BuildFailed {
            reason: format!("failed to spawn {}: {}", self.binary_path.display(), e),
        })?;

        forward_output(&mut child, &logs);

        // The build context goes in over stdin; dropping the handle signals EOF.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SkiffError::BuildFailed { reason: "missing stdin pipe".into() })?;
        stdin
            .write_all(archive)
            .await
            .map_err(|e| SkiffError::BuildFailed { reason: format!("failed to send build context: {}", e) })?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| SkiffError::BuildFailed { reason: format!("failed to wait for docker: {}", e) })?;

        if !status.success() {
            return Err(SkiffError::BuildFailed {
                reason: format!("docker build exited with {}", status),
            });
        }
        debug!(image = %image_ref, "image built");
        Ok(())
    }
}

#[async_trait]
impl RegistryPusher for DockerCli {
    async fn push_image(&self, image_ref: &str, auth: &str, logs: LogSender) -> Result<()> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("push").arg(image_ref);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Non-empty auth material is handed to docker via a throwaway config
        // directory rather than the daemon's ambient credentials. The
        // directory must outlive the child process.
        let _config_dir = if auth.is_empty() {
            None
        } else {
            let dir = registry_config_dir(image_ref, auth)?;
            cmd.env("DOCKER_CONFIG", dir.path());
            Some(dir)
        };

        let mut child = cmd.spawn().map_err(|e| SkiffError::PushFailed {
            reason: format!("failed to spawn {}: {}", self.binary_path.display(), e),
        })?;

        forward_output(&mut child, &logs);

        let status = child
            .wait()
            .await
            .map_err(|e| SkiffError::PushFailed { reason: format!("failed to wait for docker: {}", e) })?;

        if !status.success() {
            return Err(SkiffError::PushFailed {
                reason: format!("docker push exited with {}", status),
            });
        }
        debug!(image = %image_ref, "image pushed");
        Ok(())
    }
}

/// Release engine backed by the `helm` CLI.
#[derive(Clone)]
pub struct HelmCli {
    binary_path: PathBuf,
}

impl HelmCli {
    /// Create a new helm delegate, auto-detecting the binary location.
    pub fn new() -> Result<Self> {
        let binary_path = find_binary("helm")?;
        Ok(Self { binary_path })
    }

    /// Create a delegate with an explicit helm binary path.
    pub fn with_path(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }
}

#[async_trait]
impl ReleaseEngine for HelmCli {
    async fn release(
        &self,
        app_name: &str,
        namespace: &str,
        chart: &[u8],
        values_yaml: &str,
        wait: bool,
        logs: LogSender,
    ) -> Result<String> {
        // helm installs from a packaged chart on disk, so stage the archive
        // and the computed values into a scratch directory first.
        let dir = tempfile::tempdir()
            .map_err(|e| SkiffError::ReleaseFailed { reason: format!("scratch dir: {}", e) })?;
        let chart_path = dir.path().join("chart.tgz");
        let values_path = dir.path().join("values.yaml");
        tokio::fs::write(&chart_path, chart)
            .await
            .map_err(|e| SkiffError::IoError { path: chart_path.clone(), source: e })?;
        tokio::fs::write(&values_path, values_yaml)
            .await
            .map_err(|e| SkiffError::IoError { path: values_path.clone(), source: e })?;

        let mut cmd = Command::new(&self.binary_path);
        cmd.args(release_args(app_name, &chart_path, namespace, &values_path, wait));
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SkiffError::ReleaseFailed {
            reason: format!("failed to spawn {}: {}", self.binary_path.display(), e),
        })?;

        forward_output(&mut child, &logs);

        let status = child
            .wait()
            .await
            .map_err(|e| SkiffError::ReleaseFailed { reason: format!("failed to wait for helm: {}", e) })?;

        if !status.success() {
            return Err(SkiffError::ReleaseFailed {
                reason: format!("helm upgrade exited with {}", status),
            });
        }
        debug!(app = %app_name, namespace = %namespace, "chart released");

        // helm names the release after the first positional argument.
        Ok(app_name.to_string())
    }
}

/// The `helm upgrade` argument list for one release.
fn release_args(
    app_name: &str,
    chart_path: &std::path::Path,
    namespace: &str,
    values_path: &std::path::Path,
    wait: bool,
) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> = vec![
        "upgrade".into(),
        app_name.into(),
        chart_path.into(),
        "--install".into(),
        "--namespace".into(),
        namespace.into(),
        "--create-namespace".into(),
        "--values".into(),
        values_path.into(),
    ];
    if wait {
        args.push("--wait".into());
    }
    args
}

/// Spawn forwarder tasks that stream the child's stdout and stderr, one
/// log line per channel send.
fn forward_output(child: &mut Child, logs: &LogSender) {
    if let Some(stdout) = child.stdout.take() {
        let logs = logs.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if logs.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let logs = logs.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if logs.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Write a single-registry docker config to a scratch directory.
fn registry_config_dir(image_ref: &str, auth: &str) -> Result<tempfile::TempDir> {
    let registry = image_ref.split('/').next().unwrap_or(image_ref);
    let dir = tempfile::tempdir()
        .map_err(|e| SkiffError::PushFailed { reason: format!("scratch dir: {}", e) })?;
    let config = serde_json::json!({
        "auths": { registry: { "auth": auth } }
    });
    let path = dir.path().join("config.json");
    std::fs::write(&path, config.to_string())
        .map_err(|e| SkiffError::IoError { path, source: e })?;
    Ok(dir)
}

/// Find an external tool in PATH or the usual installation locations.
fn find_binary(name: &str) -> Result<PathBuf> {
    if let Ok(output) = std::process::Command::new("which").arg(name).output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    let common = [
        format!("/usr/local/bin/{}", name),
        format!("/usr/bin/{}", name),
        format!("/opt/homebrew/bin/{}", name),
    ];
    for candidate in common {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }

    Err(SkiffError::InvalidConfig {
        reason: format!("{} binary not found in PATH", name),
    })
}
