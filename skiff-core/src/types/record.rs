//! Persisted build records.

use serde::{Deserialize, Serialize};

use crate::types::{Stage, StatusCode, Summary};

/// Lifecycle state of a [`BuildRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// The pipeline run is still executing stages
    InFlight,
    /// All three stages completed successfully
    Succeeded,
    /// A stage failed or the run was cancelled; later stages never ran
    Failed,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Succeeded | RecordState::Failed)
    }
}

/// Per-stage log blobs, one per pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLogs {
    pub build: String,
    pub push: String,
    pub release: String,
}

impl StageLogs {
    /// The log blob for `stage`.
    pub fn for_stage(&self, stage: Stage) -> &str {
        match stage {
            Stage::BuildImage => &self.build,
            Stage::PushImage => &self.push,
            Stage::ReleaseChart => &self.release,
        }
    }

    fn for_stage_mut(&mut self, stage: Stage) -> &mut String {
        match stage {
            Stage::BuildImage => &mut self.build,
            Stage::PushImage => &mut self.push,
            Stage::ReleaseChart => &mut self.release,
        }
    }

    /// All three blobs concatenated in stage order.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(
            self.build.len() + self.push.len() + self.release.len(),
        );
        out.push_str(&self.build);
        out.push_str(&self.push);
        out.push_str(&self.release);
        out
    }
}

/// Persisted, append-only record of one pipeline run.
///
/// Created before any stage runs so in-flight builds are inspectable, mutated
/// by each stage as its summaries land, immutable once `state` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Globally unique, lexically sortable, time-ordered identifier (ULID)
    pub build_id: String,

    /// The application this build belongs to
    pub app_name: String,

    /// Fully qualified image reference produced by this run
    pub image: String,

    /// Name of the release this run produced, empty until ReleaseChart succeeds
    pub release: String,

    /// Lifecycle state
    pub state: RecordState,

    /// Per-stage log blobs
    pub logs: StageLogs,
}

impl BuildRecord {
    /// Create a fresh in-flight record with a new time-ordered identifier.
    pub fn new(app_name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            build_id: ulid::Ulid::new().to_string(),
            app_name: app_name.into(),
            image: image.into(),
            release: String::new(),
            state: RecordState::InFlight,
            logs: StageLogs::default(),
        }
    }

    /// Append one summary line to the log blob of the stage that emitted it.
    ///
    /// Called before the summary is forwarded to the transport, so the
    /// persisted record matches exactly what the client observed.
    pub fn append_summary(&mut self, summary: &Summary) {
        let blob = self.logs.for_stage_mut(summary.stage);
        blob.push_str(&summary.status_text);
        blob.push('\n');
        if summary.code == StatusCode::Failure {
            self.state = RecordState::Failed;
        }
    }

    /// Seal the record with its final outcome.
    pub fn seal(&mut self, state: RecordState) {
        debug_assert!(state.is_terminal());
        self.state = state;
    }
}
