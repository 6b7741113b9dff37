//! `skiff up`: package the app directory and deploy it through the daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use notify::{RecursiveMode, Watcher};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use skiff_api::skiff::v1::{up_message, UpMessage, UpRequest};
use skiff_core::archive::{self, ignore::IgnorePatterns};
use skiff_core::types::ARCHIVE_FILE_KEY;
use skiff_core::{parse_set, Values};

use crate::client::SkiffClient;
use crate::config::Config;
use crate::manifest::{Environment, Manifest};
use crate::presenter::Presenter;

/// Ignore file consulted by watch mode.
const WATCH_IGNORE_FILE: &str = ".skiffignore";

pub async fn up(
    path: Option<&str>,
    environment: &str,
    server: Option<&str>,
    watch_flag: bool,
) -> Result<()> {
    let app_dir = PathBuf::from(path.unwrap_or("."))
        .canonicalize()
        .with_context(|| format!("app directory {:?} not found", path.unwrap_or(".")))?;

    let manifest = Manifest::load(&app_dir)?;
    let env = manifest.environment(environment);
    let app_name = env.name.clone().unwrap_or_else(|| {
        app_dir.file_name().and_then(|n| n.to_str()).unwrap_or("app").to_string()
    });

    let config = Config::load()?;
    let mut client = SkiffClient::connect(&config.server_addr(server)).await?;

    if watch_flag || env.watch {
        watch_loop(&mut client, &app_dir, &app_name, &env).await
    } else {
        deploy_once(&mut client, &app_dir, &app_name, &env).await
    }
}

/// Single-shot deploy over UpBuild.
async fn deploy_once(
    client: &mut SkiffClient,
    app_dir: &Path,
    app_name: &str,
    env: &Environment,
) -> Result<()> {
    println!("Deploying {} to namespace {}", app_name.bold(), env.namespace.bold());

    let msg = upload_message(app_dir, app_name, env)?;
    let mut stream = client.up_build(msg).await?;

    let mut presenter = Presenter::new(false);
    while let Some(item) = stream.next().await {
        match item {
            Ok(msg) => {
                if let Some(up_message::Message::UpSummary(summary)) = msg.message {
                    presenter.observe(&summary);
                }
            }
            Err(status) => {
                anyhow::bail!("lost connection to server: {}", status.message());
            }
        }
    }

    if presenter.has_failures() {
        anyhow::bail!("{}", presenter.failure_report());
    }
    println!("{} deployed", app_name.green().bold());
    Ok(())
}

/// Watch mode: one UpStream connection, one new request per settled batch of
/// file changes.
async fn watch_loop(
    client: &mut SkiffClient,
    app_dir: &Path,
    app_name: &str,
    env: &Environment,
) -> Result<()> {
    let delay = Duration::from_secs(env.watch_delay);
    let ignore = load_watch_ignore(app_dir)?;

    let (req_tx, req_rx) = tokio::sync::mpsc::channel::<UpMessage>(4);
    let mut summaries = client.up_stream(ReceiverStream::new(req_rx)).await?;

    // Bridge notify's sync callback into the async loop.
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = event_tx.send(event);
        }
    })
    .context("failed to create file watcher")?;
    watcher
        .watch(app_dir, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", app_dir.display()))?;

    println!(
        "Watching {} (redeploy after {}s of quiet)",
        app_dir.display().to_string().bold(),
        env.watch_delay
    );

    req_tx
        .send(upload_message(app_dir, app_name, env)?)
        .await
        .map_err(|_| anyhow::anyhow!("lost connection to server"))?;

    let mut presenter = Presenter::new(true);
    let mut settle = Settle::new(delay);
    loop {
        tokio::select! {
            item = summaries.next() => match item {
                Some(Ok(msg)) => {
                    if let Some(up_message::Message::UpSummary(summary)) = msg.message {
                        presenter.observe(&summary);
                    }
                }
                Some(Err(status)) => {
                    anyhow::bail!("lost connection to server: {}", status.message());
                }
                None => break,
            },
            maybe_event = event_rx.recv() => {
                let Some(event) = maybe_event else { break };
                if is_relevant(&event, app_dir, &ignore) {
                    // Every relevant event pushes the deadline back, so a
                    // burst of writes coalesces into one redeploy.
                    settle.touch();
                }
            },
            _ = settle.elapsed() => {
                println!("{}", "Changes detected, redeploying".yellow());
                let sent = req_tx.send(upload_message(app_dir, app_name, env)?).await;
                if sent.is_err() {
                    anyhow::bail!("lost connection to server");
                }
            }
        }
    }

    if presenter.has_failures() {
        anyhow::bail!("{}", presenter.failure_report());
    }
    Ok(())
}

/// Assemble one upload: build context archive, packaged chart, and the
/// chart's base values with the environment's overrides applied.
fn upload_message(app_dir: &Path, app_name: &str, env: &Environment) -> Result<UpMessage> {
    let archive_bytes = archive::assemble_context(app_dir)?;

    let chart_dir = app_dir.join(archive::CHART_DIR);
    anyhow::ensure!(
        chart_dir.is_dir(),
        "no {}/ directory under {}",
        archive::CHART_DIR,
        app_dir.display()
    );
    let chart = archive::archive_dir(&chart_dir)?;

    let mut values = match std::fs::read(chart_dir.join("values.yaml")) {
        Ok(bytes) => Values::from_yaml(&bytes)?,
        Err(_) => Values::new(),
    };
    if !env.set.is_empty() {
        parse_set(&env.set.join(","), &mut values)?;
    }

    let req = UpRequest {
        app_name: app_name.to_string(),
        namespace: env.namespace.clone(),
        chart,
        values: values.to_yaml()?.into_bytes(),
        files: HashMap::from([(ARCHIVE_FILE_KEY.to_string(), archive_bytes)]),
        wait: env.wait,
    };
    Ok(UpMessage { message: Some(up_message::Message::UpRequest(req)) })
}

/// Tracks the quiet period after a file change. The redeploy fires once no
/// further relevant event has arrived for the whole delay, without blocking
/// the loop that renders summaries in the meantime.
struct Settle {
    delay: Duration,
    deadline: Option<tokio::time::Instant>,
}

impl Settle {
    fn new(delay: Duration) -> Self {
        Self { delay, deadline: None }
    }

    /// Start the quiet period, or push its deadline back.
    fn touch(&mut self) {
        self.deadline = Some(tokio::time::Instant::now() + self.delay);
    }

    /// Resolves when the quiet period elapses; pends while no change is
    /// outstanding. Cancel-safe: the deadline is only cleared on expiry.
    async fn elapsed(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

fn load_watch_ignore(app_dir: &Path) -> Result<IgnorePatterns> {
    match std::fs::read_to_string(app_dir.join(WATCH_IGNORE_FILE)) {
        Ok(content) => Ok(IgnorePatterns::parse(&content)?),
        Err(_) => Ok(IgnorePatterns::empty()),
    }
}

/// True when the event touches a path the watch ignore file doesn't exclude.
fn is_relevant(event: &notify::Event, app_dir: &Path, ignore: &IgnorePatterns) -> bool {
    if matches!(event.kind, notify::EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| {
        let rel = p.strip_prefix(app_dir).unwrap_or(p);
        !ignore.is_excluded(rel)
    })
}
