//! Proto conversions between wire messages and core types.

use skiff_api::skiff::v1::{up_message, up_summary, UpMessage, UpRequest, UpSummary};
use skiff_core::types::{BuildRequest, StatusCode, Summary};

fn status_code(code: StatusCode) -> up_summary::StatusCode {
    match code {
        StatusCode::Started => up_summary::StatusCode::Started,
        StatusCode::Progress => up_summary::StatusCode::Progress,
        StatusCode::Success => up_summary::StatusCode::Success,
        StatusCode::Failure => up_summary::StatusCode::Failure,
    }
}

/// Wrap a pipeline summary as a stream message.
pub fn summary_message(summary: Summary) -> UpMessage {
    let wire = UpSummary {
        build_id: summary.build_id,
        stage_name: summary.stage.to_string(),
        status_text: summary.status_text,
        status_code: status_code(summary.code) as i32,
    };
    UpMessage { message: Some(up_message::Message::UpSummary(wire)) }
}

/// Unpack a wire upload request into the pipeline's request type.
pub fn build_request(req: UpRequest) -> BuildRequest {
    BuildRequest {
        app_name: req.app_name,
        namespace: req.namespace,
        chart: req.chart,
        values: req.values,
        files: req.files,
        wait: req.wait,
    }
}
