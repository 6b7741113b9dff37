//! Build request and registry configuration types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, SkiffError};

/// Key under which the gzip'd build archive travels in [`BuildRequest::files`].
pub const ARCHIVE_FILE_KEY: &str = "build.tar.gz";

/// One upload unit sent by the CLI.
///
/// Owned by the client until transmitted; the server operates on its own copy.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Application name; must be a valid DNS label
    pub app_name: String,

    /// Target namespace for the release
    pub namespace: String,

    /// Packaged chart bytes (opaque to the pipeline)
    pub chart: Vec<u8>,

    /// Raw YAML value overrides merged over the chart defaults
    pub values: Vec<u8>,

    /// Named file blobs; the build archive lives under [`ARCHIVE_FILE_KEY`]
    pub files: HashMap<String, Vec<u8>>,

    /// Block the release stage until the deployment reports ready
    pub wait: bool,
}

impl BuildRequest {
    /// The build archive blob, if present.
    pub fn archive(&self) -> Option<&[u8]> {
        self.files.get(ARCHIVE_FILE_KEY).map(|b| b.as_slice())
    }

    /// Validate the request invariants: non-empty archive and chart, and an
    /// app name that is a valid DNS label.
    pub fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.app_name) {
            return Err(SkiffError::Validation {
                reason: format!("application name {:?} is not a valid DNS label", self.app_name),
            });
        }
        if self.chart.is_empty() {
            return Err(SkiffError::Validation { reason: "chart package is empty".to_string() });
        }
        match self.archive() {
            None => Err(SkiffError::Validation {
                reason: format!("request is missing the {:?} archive", ARCHIVE_FILE_KEY),
            }),
            Some(archive) if archive.is_empty() => {
                Err(SkiffError::Validation { reason: "build archive is empty".to_string() })
            }
            Some(_) => Ok(()),
        }
    }
}

/// DNS-label check: 1-63 lowercase alphanumeric or '-', no leading or
/// trailing '-'.
fn is_dns_label(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    if name.starts_with('-') || name.ends_with('-') {
        return false;
    }
    name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Destination registry configuration for built images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry URL (e.g. "quay.io", "registry.example.com:5000")
    pub url: String,

    /// Organization prefix within the registry; may be empty
    pub org: String,

    /// Base64 authorization material passed to the registry pusher
    pub auth: String,
}

impl RegistryConfig {
    /// The fully qualified image reference `registry/org/app:tag`.
    pub fn image_ref(&self, app_name: &str, tag: &str) -> String {
        let prefix = if self.org.is_empty() { String::new() } else { format!("{}/", self.org) };
        format!("{}/{}{}:{}", self.url, prefix, app_name, tag)
    }
}
