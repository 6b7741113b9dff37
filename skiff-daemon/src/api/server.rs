//! gRPC server implementation.
//!
//! Every pipeline run lives in its own task with a child cancellation token;
//! dropping the client connection cancels the runs it started but never
//! touches runs started by other connections. Summaries travel through an
//! mpsc whose receiver half is the gRPC response stream, which also gives
//! UpStream its fan-in: concurrent runs send into clones of one sender.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use skiff_api::skiff::v1::skiff_service_server::{SkiffService, SkiffServiceServer};
use skiff_api::skiff::v1::{
    up_message, GetLogsRequest, GetLogsResponse, GetVersionRequest, GetVersionResponse, UpMessage,
};
use skiff_core::types::BuildRequest;
use skiff_core::{SkiffError, Store};

use crate::pipeline::Pipeline;
use crate::proto_convert::{build_request, summary_message};

/// One wire message or a transport-level error.
type StreamItem = std::result::Result<UpMessage, Status>;

/// gRPC service implementation.
pub struct SkiffServiceImpl {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn Store>,
    /// Parent token for every run; cancelled on daemon shutdown.
    shutdown: CancellationToken,
}

impl SkiffServiceImpl {
    pub fn new(pipeline: Arc<Pipeline>, store: Arc<dyn Store>, shutdown: CancellationToken) -> Self {
        Self { pipeline, store, shutdown }
    }
}

#[tonic::async_trait]
impl SkiffService for SkiffServiceImpl {
    async fn get_version(
        &self,
        _request: Request<GetVersionRequest>,
    ) -> std::result::Result<Response<GetVersionResponse>, Status> {
        Ok(Response::new(GetVersionResponse {
            sem_ver: env!("CARGO_PKG_VERSION").to_string(),
            git_commit: option_env!("GIT_COMMIT").unwrap_or_default().to_string(),
        }))
    }

    type UpBuildStream = Pin<Box<dyn Stream<Item = StreamItem> + Send + 'static>>;

    #[instrument(skip(self, request))]
    async fn up_build(
        &self,
        request: Request<UpMessage>,
    ) -> std::result::Result<Response<Self::UpBuildStream>, Status> {
        info!("gRPC: UpBuild");

        let req = unpack_request(request.into_inner())?;
        let (tx, rx) = mpsc::channel::<StreamItem>(32);
        spawn_run(self.pipeline.clone(), req, tx, self.shutdown.child_token());

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::UpBuildStream))
    }

    type UpStreamStream = Pin<Box<dyn Stream<Item = StreamItem> + Send + 'static>>;

    #[instrument(skip(self, request))]
    async fn up_stream(
        &self,
        request: Request<tonic::Streaming<UpMessage>>,
    ) -> std::result::Result<Response<Self::UpStreamStream>, Status> {
        info!("gRPC: UpStream");

        let mut in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel::<StreamItem>(32);
        let pipeline = self.pipeline.clone();
        // All runs of this session hang off one token, so one disconnect
        // cancels exactly this session's in-flight work.
        let session = self.shutdown.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = in_stream.next() => match msg {
                        Some(Ok(m)) => match unpack_request(m) {
                            Ok(req) => {
                                spawn_run(pipeline.clone(), req, tx.clone(), session.child_token());
                            }
                            Err(status) => {
                                let _ = tx.send(Err(status)).await;
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            warn!("inbound watch stream error: {}", e);
                            session.cancel();
                            break;
                        }
                        // Half-close: no more requests, but in-flight runs
                        // drain to their terminal summaries.
                        None => break,
                    },
                    _ = session.cancelled() => break,
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::UpStreamStream))
    }

    #[instrument(skip(self, request), fields(app = %request.get_ref().app_name))]
    async fn get_logs(
        &self,
        request: Request<GetLogsRequest>,
    ) -> std::result::Result<Response<GetLogsResponse>, Status> {
        info!("gRPC: GetLogs");

        let req = request.into_inner();
        if !is_build_id(&req.build_id) {
            return Err(Status::invalid_argument(format!(
                "invalid build id {:?}: must be non-empty and alphanumeric",
                req.build_id
            )));
        }

        let record =
            self.store.get_build(&req.app_name, &req.build_id).await.map_err(status_from_error)?;
        let content = tail_lines(&record.logs.combined(), req.limit);
        Ok(Response::new(GetLogsResponse { content: content.into_bytes() }))
    }
}

/// Extract the upload request from the message envelope.
fn unpack_request(msg: UpMessage) -> std::result::Result<BuildRequest, Status> {
    match msg.message {
        Some(up_message::Message::UpRequest(req)) => Ok(build_request(req)),
        _ => Err(Status::invalid_argument("expected an UpRequest message")),
    }
}

/// Spawn one pipeline run plus its summary forwarder.
///
/// The forwarder owns the stream sender: summaries go out as they land, a
/// dropped response stream cancels the run, and an error before the first
/// stage surfaces as a gRPC status rather than a Failure summary.
fn spawn_run(
    pipeline: Arc<Pipeline>,
    req: BuildRequest,
    tx: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
) {
    let (sum_tx, mut sum_rx) = mpsc::channel(32);
    let run_cancel = cancel.clone();
    let run = tokio::spawn(async move { pipeline.run(req, sum_tx, run_cancel).await });

    tokio::spawn(async move {
        let mut client_gone = false;
        loop {
            tokio::select! {
                maybe = sum_rx.recv() => match maybe {
                    Some(summary) => {
                        if tx.send(Ok(summary_message(summary))).await.is_err() && !client_gone {
                            client_gone = true;
                            cancel.cancel();
                        }
                    }
                    // The run dropped its sender: every summary is forwarded.
                    None => break,
                },
                _ = tx.closed(), if !client_gone => {
                    client_gone = true;
                    cancel.cancel();
                }
            }
        }
        match run.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let _ = tx.send(Err(status_from_error(e))).await;
            }
            Err(e) => {
                let _ = tx.send(Err(Status::internal(format!("pipeline task failed: {}", e)))).await;
            }
        }
    });
}

/// Map a pre-stage error onto a gRPC status. Stage failures never pass
/// through here; they end the stream as Failure summaries instead.
fn status_from_error(err: SkiffError) -> Status {
    match err {
        SkiffError::Validation { .. }
        | SkiffError::InvalidValues { .. }
        | SkiffError::Context { .. }
        | SkiffError::ContextEscape { .. }
        | SkiffError::InvalidIgnorePattern { .. } => Status::invalid_argument(err.to_string()),
        SkiffError::AppNotFound { .. } | SkiffError::BuildNotFound { .. } => {
            Status::not_found(err.to_string())
        }
        SkiffError::StorageConflict { .. } | SkiffError::StorageUnavailable { .. } => {
            Status::unavailable(err.to_string())
        }
        other => Status::internal(other.to_string()),
    }
}

/// `^[a-zA-Z0-9]+$`
fn is_build_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// The last `limit` lines of `content`; non-positive means everything.
fn tail_lines(content: &str, limit: i64) -> String {
    if limit <= 0 {
        return content.to_string();
    }
    let lines: Vec<&str> = content.lines().collect();
    let skip = lines.len().saturating_sub(limit as usize);
    let mut out = lines[skip..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Start the gRPC API server, draining on shutdown.
#[instrument(skip(service, shutdown))]
pub async fn start_api_server(
    service: SkiffServiceImpl,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> skiff_core::Result<()> {
    info!("gRPC server listening on {}", addr);

    Server::builder()
        .add_service(SkiffServiceServer::new(service))
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await
        .map_err(|e| SkiffError::Transport { reason: format!("server error: {}", e) })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skiff_api::skiff::v1::{up_summary, UpRequest};
    use skiff_core::delegates::{ContainerBuilder, LogSender, RegistryPusher, ReleaseEngine};
    use skiff_core::types::{RegistryConfig, ARCHIVE_FILE_KEY};
    use skiff_core::{InprocessStore, Result};
    use std::collections::HashMap;

    use crate::pipeline::PipelineConfig;

    struct AlwaysOk;

    #[async_trait]
    impl ContainerBuilder for AlwaysOk {
        async fn build_image(&self, _: &[u8], _: &str, logs: LogSender) -> Result<()> {
            let _ = logs.send("step 1/2".to_string()).await;
            Ok(())
        }
    }

    #[async_trait]
    impl RegistryPusher for AlwaysOk {
        async fn push_image(&self, _: &str, _: &str, _: LogSender) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ReleaseEngine for AlwaysOk {
        async fn release(
            &self,
            app: &str,
            _: &str,
            _: &[u8],
            _: &str,
            _: bool,
            _: LogSender,
        ) -> Result<String> {
            Ok(app.to_string())
        }
    }

    fn service() -> SkiffServiceImpl {
        let store: Arc<dyn Store> = Arc::new(InprocessStore::new());
        let delegates = Arc::new(AlwaysOk);
        let config = PipelineConfig {
            registry: RegistryConfig {
                url: "registry.example.com".to_string(),
                org: "team".to_string(),
                auth: String::new(),
            },
            basedomain: "example.com".to_string(),
        };
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            delegates.clone(),
            delegates.clone(),
            delegates,
            config,
        ));
        SkiffServiceImpl::new(pipeline, store, CancellationToken::new())
    }

    fn upload_message() -> UpMessage {
        let req = UpRequest {
            app_name: "demo".to_string(),
            namespace: "default".to_string(),
            chart: vec![1, 2, 3],
            values: Vec::new(),
            files: HashMap::from([(ARCHIVE_FILE_KEY.to_string(), vec![b'x'; 100])]),
            wait: false,
        };
        UpMessage { message: Some(up_message::Message::UpRequest(req)) }
    }

    async fn collect(mut stream: Pin<Box<dyn Stream<Item = StreamItem> + Send>>) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn up_build_streams_summaries_and_closes() {
        let svc = service();
        let response = svc.up_build(Request::new(upload_message())).await.unwrap();
        let items = collect(response.into_inner()).await;

        assert!(!items.is_empty());
        let mut successes = 0;
        for item in items {
            let msg = item.expect("no transport error expected");
            match msg.message {
                Some(up_message::Message::UpSummary(s)) => {
                    if s.status_code == up_summary::StatusCode::Success as i32 {
                        successes += 1;
                    }
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(successes, 3, "one Success per stage");
    }

    /// Serve one in-process connection over a duplex pipe and hand back a
    /// connected client.
    async fn duplex_client(
        svc: SkiffServiceImpl,
    ) -> skiff_api::skiff::v1::skiff_service_client::SkiffServiceClient<tonic::transport::Channel>
    {
        let (client_io, server_io) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            Server::builder()
                .add_service(SkiffServiceServer::new(svc))
                .serve_with_incoming(tokio_stream::iter(vec![Ok::<_, std::io::Error>(server_io)]))
                .await
        });

        let mut client_io = Some(client_io);
        let channel = tonic::transport::Endpoint::try_from("http://[::]:0")
            .unwrap()
            .connect_with_connector(tower::service_fn(move |_: tonic::transport::Uri| {
                let io = client_io.take();
                async move {
                    io.ok_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "connection already taken")
                    })
                }
            }))
            .await
            .unwrap();
        skiff_api::skiff::v1::skiff_service_client::SkiffServiceClient::new(channel)
    }

    #[tokio::test]
    async fn up_stream_multiplexes_runs_without_loss() {
        use skiff_core::types::Stage;

        let mut client = duplex_client(service()).await;

        // Three uploads over one connection, then the client half-closes.
        // Distinct archives so the runs don't even share an image tag.
        let requests = tokio_stream::iter((0..3u8).map(|i| {
            let mut msg = upload_message();
            if let Some(up_message::Message::UpRequest(req)) = msg.message.as_mut() {
                req.app_name = format!("demo{}", i);
                req.files.insert(ARCHIVE_FILE_KEY.to_string(), vec![i; 32]);
            }
            msg
        }));
        let mut stream = client.up_stream(requests).await.unwrap().into_inner();

        let mut per_run: HashMap<String, Vec<skiff_api::skiff::v1::UpSummary>> = HashMap::new();
        while let Some(item) = stream.next().await {
            let msg = item.expect("no transport error expected");
            match msg.message {
                Some(up_message::Message::UpSummary(s)) => {
                    per_run.entry(s.build_id.clone()).or_default().push(s);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }

        // One run per request, drained to its terminal state after the
        // half-close; nothing lost or duplicated across the fan-in. Each run
        // emits exactly seven summaries: Started/Progress/Success for the
        // build stage, Started/Success for push and for release.
        assert_eq!(per_run.len(), 3);
        for run in per_run.values() {
            assert_eq!(run.len(), 7);
        }

        let position = |run: &[skiff_api::skiff::v1::UpSummary],
                        stage: Stage,
                        code: up_summary::StatusCode| {
            run.iter()
                .position(|s| s.stage_name == stage.to_string() && s.status_code == code as i32)
                .unwrap_or_else(|| panic!("missing {:?} for stage {}", code, stage))
        };
        for run in per_run.values() {
            // Each run's summaries arrive in emission order: a stage only
            // starts after the previous stage's Success.
            assert!(
                position(run, Stage::PushImage, up_summary::StatusCode::Started)
                    > position(run, Stage::BuildImage, up_summary::StatusCode::Success)
            );
            assert!(
                position(run, Stage::ReleaseChart, up_summary::StatusCode::Started)
                    > position(run, Stage::PushImage, up_summary::StatusCode::Success)
            );
            let last = run.last().unwrap();
            assert_eq!(last.stage_name, Stage::ReleaseChart.to_string());
            assert_eq!(last.status_code, up_summary::StatusCode::Success as i32);
        }
    }

    #[tokio::test]
    async fn up_build_rejects_summary_envelope() {
        let svc = service();
        let msg = UpMessage {
            message: Some(up_message::Message::UpSummary(Default::default())),
        };
        let err = svc.up_build(Request::new(msg)).await.err().unwrap();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn up_build_surfaces_validation_as_status_not_summary() {
        let svc = service();
        let mut msg = upload_message();
        if let Some(up_message::Message::UpRequest(req)) = msg.message.as_mut() {
            req.app_name = "Not-A-Label".to_string();
        }
        let response = svc.up_build(Request::new(msg)).await.unwrap();
        let items = collect(response.into_inner()).await;

        assert_eq!(items.len(), 1);
        let status = items.into_iter().next().unwrap().err().unwrap();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn get_logs_tails_and_validates_id() {
        let svc = service();
        let response = svc.up_build(Request::new(upload_message())).await.unwrap();
        let items = collect(response.into_inner()).await;
        let build_id = match &items[0] {
            Ok(UpMessage { message: Some(up_message::Message::UpSummary(s)) }) => s.build_id.clone(),
            other => panic!("expected a summary first, got {:?}", other),
        };

        let logs = svc
            .get_logs(Request::new(GetLogsRequest {
                app_name: "demo".to_string(),
                build_id: build_id.clone(),
                limit: 0,
            }))
            .await
            .unwrap()
            .into_inner();
        let text = String::from_utf8(logs.content).unwrap();
        assert!(text.contains("step 1/2"));
        assert!(text.contains("success"));

        let tail = svc
            .get_logs(Request::new(GetLogsRequest {
                app_name: "demo".to_string(),
                build_id,
                limit: 1,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(String::from_utf8(tail.content).unwrap(), "success\n");

        let err = svc
            .get_logs(Request::new(GetLogsRequest {
                app_name: "demo".to_string(),
                build_id: "not-a-build-id!".to_string(),
                limit: 0,
            }))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn get_logs_for_unknown_build_is_not_found() {
        let svc = service();
        let err = svc
            .get_logs(Request::new(GetLogsRequest {
                app_name: "ghost".to_string(),
                build_id: "01ABC".to_string(),
                limit: 0,
            }))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[test]
    fn tail_lines_keeps_the_last_n() {
        let content = "a\nb\nc\n";
        assert_eq!(tail_lines(content, 0), content);
        assert_eq!(tail_lines(content, -1), content);
        assert_eq!(tail_lines(content, 2), "b\nc\n");
        assert_eq!(tail_lines(content, 10), "a\nb\nc\n");
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn build_id_charset() {
        assert!(is_build_id("01HZXW5D8RKQ"));
        assert!(!is_build_id(""));
        assert!(!is_build_id("abc-def"));
        assert!(!is_build_id("../etc/passwd"));
    }
}
