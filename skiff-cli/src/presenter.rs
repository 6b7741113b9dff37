//! Renders interleaved pipeline summaries.
//!
//! Summaries for concurrent builds arrive interleaved on one stream; each is
//! keyed by (build id, stage name) so output stays attributable. Failure text
//! is collected rather than printed inline so the command can exit non-zero
//! with the reason last.

use colored::Colorize;
use std::collections::HashSet;

use skiff_api::skiff::v1::{up_summary, UpSummary};

#[derive(Default)]
pub struct Presenter {
    /// (build_id, stage_name) pairs that already printed their Started line.
    started: HashSet<(String, String)>,
    /// Terminal failure text, one entry per failed stage.
    failures: Vec<String>,
    /// Print build ids with each line (watch mode, interleaved builds).
    tag_builds: bool,
}

impl Presenter {
    pub fn new(tag_builds: bool) -> Self {
        Self { tag_builds, ..Default::default() }
    }

    /// Render one summary.
    pub fn observe(&mut self, summary: &UpSummary) {
        if let Some(line) = self.render(summary) {
            println!("{}", line);
        }
    }

    /// The display line for one summary, or `None` when it adds nothing
    /// (a repeated Started for a stage already shown).
    fn render(&mut self, summary: &UpSummary) -> Option<String> {
        let prefix = if self.tag_builds {
            format!("[{}] ", short_id(&summary.build_id))
        } else {
            String::new()
        };

        match summary.status_code() {
            up_summary::StatusCode::Started => {
                let key = (summary.build_id.clone(), summary.stage_name.clone());
                if !self.started.insert(key) {
                    return None;
                }
                Some(format!("{}{}...", prefix, summary.stage_name.bold()))
            }
            up_summary::StatusCode::Progress => {
                Some(format!("{}  {}", prefix, summary.status_text))
            }
            up_summary::StatusCode::Success => {
                Some(format!("{}{}: {}", prefix, summary.stage_name.bold(), "ok".green()))
            }
            up_summary::StatusCode::Failure => {
                self.failures
                    .push(format!("{}: {}", summary.stage_name, summary.status_text));
                Some(format!(
                    "{}{}: {}",
                    prefix,
                    summary.stage_name.bold(),
                    summary.status_text.red()
                ))
            }
            up_summary::StatusCode::Unknown => {
                Some(format!("{}{}: {}", prefix, summary.stage_name, summary.status_text))
            }
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// The collected failure text, one line per failed stage.
    pub fn failure_report(&self) -> String {
        self.failures.join("\n")
    }
}

/// Last 6 characters of a build id, enough to tell interleaved builds apart.
fn short_id(build_id: &str) -> &str {
    let len = build_id.len();
    &build_id[len.saturating_sub(6)..]
}
