//! Domain types shared between the daemon and the CLI.

mod build;
mod record;

pub use build::{BuildRequest, RegistryConfig, ARCHIVE_FILE_KEY};
pub use record::{BuildRecord, RecordState, StageLogs};

use serde::{Deserialize, Serialize};
use std::fmt;

/// One discrete phase of the deployment pipeline.
///
/// The sequence is fixed: BuildImage, then PushImage, then ReleaseChart.
/// No stage runs out of order and none is skipped on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    BuildImage,
    PushImage,
    ReleaseChart,
}

impl Stage {
    /// Human-readable stage description used to tag summaries on the wire.
    pub fn describe(&self) -> &'static str {
        match self {
            Stage::BuildImage => "Building container image",
            Stage::PushImage => "Pushing container image",
            Stage::ReleaseChart => "Releasing application",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Status code carried by a [`Summary`].
///
/// Summaries for one stage form a finite ordered sequence: one Started,
/// zero or more Progress, then exactly one of Success or Failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Started,
    Progress,
    Success,
    Failure,
}

impl StatusCode {
    /// True for the codes that end a stage's summary sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusCode::Success | StatusCode::Failure)
    }
}

/// One progress event emitted by a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// The build this event belongs to
    pub build_id: String,

    /// The stage that emitted it
    pub stage: Stage,

    /// Human-readable status text
    pub status_text: String,

    /// Status code
    pub code: StatusCode,
}

impl Summary {
    pub fn new(
        build_id: impl Into<String>,
        stage: Stage,
        status_text: impl Into<String>,
        code: StatusCode,
    ) -> Self {
        Self { build_id: build_id.into(), stage, status_text: status_text.into(), code }
    }
}
