//! The build/release pipeline engine.
//!
//! One `Pipeline` serves the whole daemon; each accepted request gets one
//! `run()` with its own transient state. The state machine is Idle →
//! BuildingImage → PushingImage → ReleasingChart → Succeeded | Failed, with
//! the stage order enforced by sequential awaits: a stage only starts after
//! the previous one emitted its terminal Success, and any stage failure ends
//! the run. Nothing is retried; a retry is a new upload.

use skiff_core::delegates::{ContainerBuilder, RegistryPusher, ReleaseEngine};
use skiff_core::{
    archive, parse_set, BuildRecord, BuildRequest, RecordState, RegistryConfig, Result,
    SkiffError, Stage, StatusCode, Store, Summary, Values,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Server-side settings the pipeline needs to derive per-request state.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub registry: RegistryConfig,
    /// Base domain injected into chart values for ingress construction
    pub basedomain: String,
}

/// Transient per-run state, owned by exactly one pipeline run.
struct AppContext {
    /// Content-hash image tag (SHA-1 of the build archive)
    tag: String,
    /// Fully qualified image reference `registry/org/app:tag`
    image: String,
    /// Merged value overrides, image coordinates injected
    values: Values,
}

impl AppContext {
    /// Derive the per-request state: content-hash tag, image reference, and
    /// the value tree with the computed image coordinates layered on top.
    fn new(req: &BuildRequest, config: &PipelineConfig) -> Result<Self> {
        // The unwrap-free path: validate() already guaranteed the archive.
        let archive_bytes = req.archive().ok_or_else(|| SkiffError::Validation {
            reason: "request is missing the build archive".to_string(),
        })?;
        let tag = archive::image_tag(archive_bytes);
        let image = config.registry.image_ref(&req.app_name, &tag);

        let mut values = Values::from_yaml(&req.values)?;
        let inject = format!(
            "image.name={},image.org={},image.registry={},image.tag={},basedomain={},onskiff=true",
            req.app_name, config.registry.org, config.registry.url, tag, config.basedomain,
        );
        parse_set(&inject, &mut values)?;

        Ok(Self { tag, image, values })
    }
}

/// The pipeline engine: drives Build Image → Push Image → Release Chart for
/// each request, emitting summaries and persisting the build record.
pub struct Pipeline {
    store: Arc<dyn Store>,
    builder: Arc<dyn ContainerBuilder>,
    pusher: Arc<dyn RegistryPusher>,
    releaser: Arc<dyn ReleaseEngine>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        builder: Arc<dyn ContainerBuilder>,
        pusher: Arc<dyn RegistryPusher>,
        releaser: Arc<dyn ReleaseEngine>,
        config: PipelineConfig,
    ) -> Self {
        Self { store, builder, pusher, releaser, config }
    }

    /// Run the full pipeline for one validated request.
    ///
    /// Summaries stream out on `out`; every one is appended to the build
    /// record before it is forwarded, so the persisted record matches what
    /// the client observed even if the client goes away mid-stream.
    ///
    /// Returns the build ID. An `Err` is only produced for failures before
    /// the first stage starts (bad request, unreachable storage); once stages
    /// run, their failures are reported as terminal Failure summaries and the
    /// run itself resolves `Ok`.
    #[instrument(skip(self, req, out, cancel), fields(app = %req.app_name))]
    pub async fn run(
        &self,
        req: BuildRequest,
        out: mpsc::Sender<Summary>,
        cancel: CancellationToken,
    ) -> Result<String> {
        req.validate()?;
        let ctx = AppContext::new(&req, &self.config)?;

        // The record exists before any stage runs so in-flight builds are
        // inspectable. An unreachable backend is fatal here.
        let mut record = BuildRecord::new(&req.app_name, &ctx.image);
        self.store.create_build(&req.app_name, &record).await?;
        let build_id = record.build_id.clone();
        info!(build_id = %build_id, image = %ctx.image, "pipeline run starting");

        let outcome = self.run_stages(&req, &ctx, &mut record, &out, &cancel).await;

        match outcome {
            Ok(()) => record.seal(RecordState::Succeeded),
            Err(_) => record.seal(RecordState::Failed),
        }
        // A persistence failure must not rewrite history the client already
        // saw; report it on its own.
        if let Err(e) = self.store.update_build(&req.app_name, &record).await {
            error!(build_id = %build_id, "failed to persist final build record: {}", e);
        }
        info!(build_id = %build_id, state = ?record.state, "pipeline run finished");
        Ok(build_id)
    }

    async fn run_stages(
        &self,
        req: &BuildRequest,
        ctx: &AppContext,
        record: &mut BuildRecord,
        out: &mpsc::Sender<Summary>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let archive_bytes = req.archive().unwrap_or_default();

        let (log_tx, log_rx) = mpsc::channel(64);
        self.drive_stage(
            Stage::BuildImage,
            self.builder.build_image(archive_bytes, &ctx.image, log_tx),
            log_rx,
            record,
            out,
            cancel,
        )
        .await?;

        let (log_tx, log_rx) = mpsc::channel(64);
        self.drive_stage(
            Stage::PushImage,
            self.pusher.push_image(&ctx.image, &self.config.registry.auth, log_tx),
            log_rx,
            record,
            out,
            cancel,
        )
        .await?;

        let values_yaml = ctx.values.to_yaml()?;
        let (log_tx, log_rx) = mpsc::channel(64);
        let release = self
            .drive_stage(
                Stage::ReleaseChart,
                self.releaser.release(&req.app_name, &req.namespace, &req.chart, &values_yaml, req.wait, log_tx),
                log_rx,
                record,
                out,
                cancel,
            )
            .await?;
        record.release = release;
        Ok(())
    }

    /// Drive one stage: emit Started, forward delegate log lines as Progress,
    /// then exactly one terminal Success or Failure. The record is updated in
    /// storage at the stage boundary.
    async fn drive_stage<T, F>(
        &self,
        stage: Stage,
        work: F,
        mut log_rx: mpsc::Receiver<String>,
        record: &mut BuildRecord,
        out: &mpsc::Sender<Summary>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        emit(record, out, stage, "started", StatusCode::Started).await;

        let result = {
            tokio::pin!(work);
            let mut logs_open = true;
            loop {
                tokio::select! {
                    res = &mut work => break res,
                    maybe_line = log_rx.recv(), if logs_open => {
                        match maybe_line {
                            Some(line) => {
                                emit(record, out, stage, &line, StatusCode::Progress).await;
                            }
                            None => logs_open = false,
                        }
                    }
                    _ = cancel.cancelled() => {
                        // Dropping the work future aborts the delegated
                        // operation; completed stages keep their logs.
                        break Err(SkiffError::Cancelled { stage });
                    }
                }
            }
            // `work` is dropped here, on the cancel path included, so every
            // log sender it held is released before the drain below.
        };

        // Drain to the end of the log channel: lines the delegate (or its
        // output forwarders) produced right before resolving are still in
        // flight at this point and belong before the terminal summary.
        while let Some(line) = log_rx.recv().await {
            emit(record, out, stage, &line, StatusCode::Progress).await;
        }

        match &result {
            Ok(_) => emit(record, out, stage, "success", StatusCode::Success).await,
            Err(e) => {
                emit(record, out, stage, &format!("failure: {}", e), StatusCode::Failure).await
            }
        }

        if let Err(e) = self.store.update_build(&record.app_name, record).await {
            warn!(build_id = %record.build_id, stage = %stage, "failed to persist stage logs: {}", e);
        }
        result
    }
}

/// Append a summary to the record, then forward it. A closed outbound
/// channel only means the client stopped listening; the record still gets
/// the full history.
async fn emit(
    record: &mut BuildRecord,
    out: &mpsc::Sender<Summary>,
    stage: Stage,
    text: &str,
    code: StatusCode,
) {
    let summary = Summary::new(record.build_id.clone(), stage, text, code);
    record.append_summary(&summary);
    let _ = out.send(summary).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skiff_core::delegates::LogSender;
    use skiff_core::types::ARCHIVE_FILE_KEY;
    use skiff_core::InprocessStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Mock delegates with scriptable outcomes.
    #[derive(Default)]
    struct MockDelegates {
        fail_build: bool,
        fail_push: bool,
        fail_release: bool,
        /// When set, release blocks until cancelled
        hang_release: bool,
        /// When set, release hands its log sender to a task that reports
        /// after the stage itself has returned
        late_release_log: bool,
        calls: AtomicUsize,
        saw_wait: AtomicBool,
    }

    impl MockDelegates {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContainerBuilder for MockDelegates {
        async fn build_image(
            &self,
            _archive: &[u8],
            _image_ref: &str,
            logs: LogSender,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = logs.send("step 1/2".to_string()).await;
            let _ = logs.send("step 2/2".to_string()).await;
            if self.fail_build {
                return Err(SkiffError::BuildFailed { reason: "no space left".to_string() });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RegistryPusher for MockDelegates {
        async fn push_image(&self, _image_ref: &str, _auth: &str, logs: LogSender) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = logs.send("pushed layer".to_string()).await;
            if self.fail_push {
                return Err(SkiffError::PushFailed { reason: "denied".to_string() });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ReleaseEngine for MockDelegates {
        async fn release(
            &self,
            app_name: &str,
            _namespace: &str,
            _chart: &[u8],
            _values_yaml: &str,
            wait: bool,
            logs: LogSender,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.saw_wait.store(wait, Ordering::SeqCst);
            if self.hang_release {
                // Simulates a long-running external release; aborted by drop.
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.late_release_log {
                // Mirrors the exec forwarders: a task still holding the log
                // sender after the delegate call itself has returned.
                let logs = logs.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let _ = logs.send("release: final status".to_string()).await;
                });
            }
            let _ = logs.send(format!("{} deployed", app_name)).await;
            if self.fail_release {
                return Err(SkiffError::ReleaseFailed { reason: "timed out".to_string() });
            }
            Ok(format!("{}-release", app_name))
        }
    }

    fn request(app: &str, archive: Vec<u8>) -> BuildRequest {
        BuildRequest {
            app_name: app.to_string(),
            namespace: "default".to_string(),
            chart: b"chart-package".to_vec(),
            values: b"replicas: 2\n".to_vec(),
            files: HashMap::from([(ARCHIVE_FILE_KEY.to_string(), archive)]),
            wait: false,
        }
    }

    fn pipeline(delegates: Arc<MockDelegates>) -> (Pipeline, Arc<InprocessStore>) {
        let store = Arc::new(InprocessStore::new());
        let config = PipelineConfig {
            registry: RegistryConfig {
                url: "registry.example.com".to_string(),
                org: "team".to_string(),
                auth: "c2VjcmV0".to_string(),
            },
            basedomain: "apps.example.com".to_string(),
        };
        let p = Pipeline::new(
            store.clone(),
            delegates.clone(),
            delegates.clone(),
            delegates,
            config,
        );
        (p, store)
    }

    async fn collect(
        p: &Pipeline,
        req: BuildRequest,
        cancel: CancellationToken,
    ) -> (Result<String>, Vec<Summary>) {
        let (tx, mut rx) = mpsc::channel(128);
        let result = p.run(req, tx, cancel).await;
        let mut summaries = Vec::new();
        while let Ok(s) = rx.try_recv() {
            summaries.push(s);
        }
        (result, summaries)
    }

    fn terminal_for(summaries: &[Summary], stage: Stage) -> Vec<&Summary> {
        summaries.iter().filter(|s| s.stage == stage && s.code.is_terminal()).collect()
    }

    #[tokio::test]
    async fn test_happy_path_reaches_succeeded() {
        let delegates = Arc::new(MockDelegates::default());
        let (p, store) = pipeline(delegates.clone());

        let (result, summaries) =
            collect(&p, request("demo", vec![b'x'; 100]), CancellationToken::new()).await;
        let build_id = result.unwrap();

        // Scenario A: content-hash tag for 100 bytes of 'x'.
        let record = store.get_build("demo", &build_id).await.unwrap();
        assert_eq!(
            record.image,
            "registry.example.com/team/demo:50e483690ec481f4af7f6fb524b2b99eb1716565"
        );
        assert_eq!(record.state, RecordState::Succeeded);
        assert_eq!(record.release, "demo-release");
        assert_eq!(delegates.calls(), 3);

        // Exactly one terminal summary per stage, all Success.
        for stage in [Stage::BuildImage, Stage::PushImage, Stage::ReleaseChart] {
            let terminals = terminal_for(&summaries, stage);
            assert_eq!(terminals.len(), 1, "stage {:?}", stage);
            assert_eq!(terminals[0].code, StatusCode::Success);
        }
        // Nothing after the run's terminal summary.
        assert_eq!(summaries.last().unwrap().stage, Stage::ReleaseChart);
        assert!(summaries.last().unwrap().code.is_terminal());
    }

    #[tokio::test]
    async fn test_stage_ordering_is_strict() {
        let delegates = Arc::new(MockDelegates::default());
        let (p, _store) = pipeline(delegates);
        let (result, summaries) =
            collect(&p, request("demo", vec![1, 2, 3]), CancellationToken::new()).await;
        result.unwrap();

        let position = |stage: Stage, code: StatusCode| {
            summaries.iter().position(|s| s.stage == stage && s.code == code).unwrap()
        };
        // Push never starts before build's terminal Success; release never
        // starts before push's.
        assert!(position(Stage::PushImage, StatusCode::Started)
            > position(Stage::BuildImage, StatusCode::Success));
        assert!(position(Stage::ReleaseChart, StatusCode::Started)
            > position(Stage::PushImage, StatusCode::Success));
    }

    #[tokio::test]
    async fn test_identical_requests_share_a_tag_but_not_a_record() {
        let delegates = Arc::new(MockDelegates::default());
        let (p, store) = pipeline(delegates);

        let req = request("demo", vec![b'a'; 64]);
        let (first, _) = collect(&p, req.clone(), CancellationToken::new()).await;
        let (second, _) = collect(&p, req, CancellationToken::new()).await;
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first, second);

        let records = store.get_builds("demo").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].image, records[1].image);
    }

    #[tokio::test]
    async fn test_build_failure_stops_the_pipeline() {
        let delegates =
            Arc::new(MockDelegates { fail_build: true, ..MockDelegates::default() });
        let (p, store) = pipeline(delegates.clone());

        let (result, summaries) =
            collect(&p, request("demo", vec![b'x'; 10]), CancellationToken::new()).await;
        let build_id = result.unwrap();

        // Scenario C: exactly one Failure, tagged BuildImage; later stages
        // never start and their logs stay empty.
        let failures: Vec<_> =
            summaries.iter().filter(|s| s.code == StatusCode::Failure).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stage, Stage::BuildImage);
        assert!(summaries.iter().all(|s| s.stage == Stage::BuildImage));
        assert_eq!(delegates.calls(), 1);

        let record = store.get_build("demo", &build_id).await.unwrap();
        assert_eq!(record.state, RecordState::Failed);
        assert!(record.logs.push.is_empty());
        assert!(record.logs.release.is_empty());
        assert!(record.logs.build.contains("failure: Image build failed: no space left"));
    }

    #[tokio::test]
    async fn test_push_failure_skips_release() {
        let delegates = Arc::new(MockDelegates { fail_push: true, ..MockDelegates::default() });
        let (p, store) = pipeline(delegates.clone());
        let (result, summaries) =
            collect(&p, request("demo", vec![b'x'; 10]), CancellationToken::new()).await;
        let build_id = result.unwrap();

        assert!(summaries.iter().all(|s| s.stage != Stage::ReleaseChart));
        assert_eq!(delegates.calls(), 2);
        let record = store.get_build("demo", &build_id).await.unwrap();
        assert_eq!(record.state, RecordState::Failed);
        assert!(record.release.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_mid_release_aborts_and_records_failure() {
        let delegates =
            Arc::new(MockDelegates { hang_release: true, ..MockDelegates::default() });
        let (p, store) = pipeline(delegates.clone());
        let cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::channel::<Summary>(128);
        let canceller = cancel.clone();
        let waiter = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(s) = rx.recv().await {
                // Scenario D: cancel once the release stage has started.
                if s.stage == Stage::ReleaseChart && s.code == StatusCode::Started {
                    canceller.cancel();
                }
                seen.push(s);
            }
            seen
        });

        let build_id = p.run(request("demo", vec![b'x'; 10]), tx, cancel).await.unwrap();
        let summaries = waiter.await.unwrap();

        let last = summaries.last().unwrap();
        assert_eq!(last.stage, Stage::ReleaseChart);
        assert_eq!(last.code, StatusCode::Failure);
        assert!(last.status_text.contains("cancelled"));

        let record = store.get_build("demo", &build_id).await.unwrap();
        assert_eq!(record.state, RecordState::Failed);
        // Completed stages keep their logs.
        assert!(record.logs.build.contains("success"));
        assert!(record.logs.push.contains("success"));
        // No further delegate calls were made after the abort.
        assert_eq!(delegates.calls(), 3);
    }

    #[tokio::test]
    async fn test_wait_flag_reaches_the_release_engine() {
        let delegates = Arc::new(MockDelegates::default());
        let (p, _store) = pipeline(delegates.clone());

        let mut req = request("demo", vec![b'x'; 10]);
        req.wait = true;
        let (result, _) = collect(&p, req, CancellationToken::new()).await;
        result.unwrap();
        assert!(delegates.saw_wait.load(Ordering::SeqCst));

        let (result, _) =
            collect(&p, request("demo", vec![b'x'; 10]), CancellationToken::new()).await;
        result.unwrap();
        assert!(!delegates.saw_wait.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_log_lines_straggling_past_stage_exit_are_kept() {
        let delegates =
            Arc::new(MockDelegates { late_release_log: true, ..MockDelegates::default() });
        let (p, store) = pipeline(delegates);

        let (result, summaries) =
            collect(&p, request("demo", vec![b'x'; 10]), CancellationToken::new()).await;
        let build_id = result.unwrap();

        // The straggler lands as a Progress summary before the terminal one.
        let line = summaries
            .iter()
            .position(|s| s.status_text == "release: final status")
            .expect("straggling log line was dropped");
        let terminal = summaries
            .iter()
            .position(|s| s.stage == Stage::ReleaseChart && s.code.is_terminal())
            .unwrap();
        assert!(line < terminal);

        let record = store.get_build("demo", &build_id).await.unwrap();
        assert!(record.logs.release.contains("release: final status"));
    }

    #[tokio::test]
    async fn test_invalid_request_never_starts_a_run() {
        let delegates = Arc::new(MockDelegates::default());
        let (p, store) = pipeline(delegates.clone());

        let mut req = request("demo", vec![b'x'; 10]);
        req.chart.clear();
        let (result, summaries) = collect(&p, req, CancellationToken::new()).await;

        assert!(matches!(result, Err(SkiffError::Validation { .. })));
        assert!(summaries.is_empty());
        assert_eq!(delegates.calls(), 0);
        assert!(store.get_builds("demo").await.is_err());
    }

    #[tokio::test]
    async fn test_values_injection_layers_image_coordinates() {
        let req = request("demo", vec![b'x'; 100]);
        let config = PipelineConfig {
            registry: RegistryConfig {
                url: "registry.example.com".to_string(),
                org: "team".to_string(),
                auth: String::new(),
            },
            basedomain: "apps.example.com".to_string(),
        };
        let ctx = AppContext::new(&req, &config).unwrap();

        assert_eq!(ctx.tag, "50e483690ec481f4af7f6fb524b2b99eb1716565");
        assert_eq!(
            ctx.values.get_path("image.registry"),
            Some(&skiff_core::Value::String("registry.example.com".to_string()))
        );
        assert_eq!(ctx.values.get_path("onskiff"), Some(&skiff_core::Value::Bool(true)));
        // Request-level values survive the injection.
        assert_eq!(ctx.values.get_path("replicas"), Some(&skiff_core::Value::Int(2)));
    }
}
