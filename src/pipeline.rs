// SPDX-License-Identifier: Apache-2.0

//! Per-source pipeline assembly.
//!
//! Every discovered file gets its own tailer → batcher → forwarder chain
//! over bounded channels, supervised in one `JoinSet`. A stalled endpoint
//! backpressures through the channels until the tailer simply stops
//! reading, which is safe: the file persists and the recorded offset says
//! where to resume.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, info, warn};

use crate::batch::{self, Batch, BATCH_CHANNEL_CAPACITY};
use crate::bounded_channel::{bounded, BoundedReceiver};
use crate::config::FileSourceConfig;
use crate::discover::{DiscoveredFile, GlobDiscoverer, DISCOVERY_CHANNEL_CAPACITY};
use crate::error::Result;
use crate::forward::{Forwarder, ForwarderConfig, HttpsClient};
use crate::kubernetes::{self, ExcludeRules};
use crate::metadata::LogEvent;
use crate::shutdown::SHUTDOWN_GRACE;
use crate::state::StateStore;
use crate::tail::file::{FileTailer, TailConfig};
use crate::tail::reader::ReaderTailer;
use crate::tail::{LineRecord, Tailer};

/// Everything a source pipeline needs from the outside world.
pub struct PipelineContext {
    pub store: Arc<StateStore>,
    pub client: HttpsClient,
    pub base_metadata: LogEvent,
    pub endpoint: String,
    pub batch_period: Duration,
    pub tail: TailConfig,
    pub quit: CancellationToken,
}

/// How discovered files are treated before a pipeline is built for them.
pub enum SourceFlavor {
    Plain,
    Kubernetes(ExcludeRules),
}

fn source_lines(tailer: &mut impl Tailer) -> BoundedReceiver<LineRecord> {
    tailer.take_lines()
}

/// Run discovery over the configured patterns and a pipeline per discovered
/// file until shutdown.
pub async fn run_file_sources(
    ctx: PipelineContext,
    sources: Vec<FileSourceConfig>,
    flavor: SourceFlavor,
) -> std::result::Result<(), BoxError> {
    let mut tasks: JoinSet<std::result::Result<(), BoxError>> = JoinSet::new();

    let (found_tx, mut found_rx) = bounded::<DiscoveredFile>(DISCOVERY_CHANNEL_CAPACITY);
    for source in sources {
        let discoverer = GlobDiscoverer::new(source.path, source.api_key);
        let sink = found_tx.clone();
        let quit = ctx.quit.clone();
        tasks.spawn(async move { discoverer.run(sink, quit).await });
    }
    drop(found_tx);

    // Per-source stop tokens. Cancelling one drops that source mid-run
    // (the Kubernetes exclusion path) without touching the others.
    let mut stop_tokens: HashMap<PathBuf, CancellationToken> = HashMap::new();
    let mut discovering = true;

    loop {
        tokio::select! {
            _ = ctx.quit.cancelled() => break,

            discovered = found_rx.next(), if discovering => match discovered {
                Some(discovered) => {
                    handle_discovered(&ctx, &flavor, &mut tasks, &mut stop_tokens, discovered);
                }
                None => {
                    // Every discoverer has exited (glob errors are fatal per
                    // discoverer). Existing pipelines keep running.
                    discovering = false;
                }
            },

            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                match result {
                    Ok(Ok(())) => {}
                    // A per-source failure (e.g. a 4xx from the endpoint)
                    // terminates that pipeline only.
                    Ok(Err(e)) => error!(error = %e, "Pipeline task failed"),
                    Err(e) => error!(error = %e, "Pipeline task panicked"),
                }
            }
        }
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    if wait_for_tasks_with_deadline(&mut tasks, deadline).await.is_err() {
        warn!("Timed out waiting for pipelines to drain");
    }

    Ok(())
}

fn handle_discovered(
    ctx: &PipelineContext,
    flavor: &SourceFlavor,
    tasks: &mut JoinSet<std::result::Result<(), BoxError>>,
    stop_tokens: &mut HashMap<PathBuf, CancellationToken>,
    discovered: DiscoveredFile,
) {
    let mut metadata = ctx.base_metadata.for_source_file(&discovered.path);

    if let SourceFlavor::Kubernetes(rules) = flavor {
        match kubernetes::parse_log_file(&discovered.path) {
            Ok(k8s_context) => {
                if let Some(filter) = rules.apply_filter(&k8s_context) {
                    info!(
                        path = %discovered.path.display(),
                        filter = %filter,
                        "File logs will not be forwarded due to matching an exclusion filter"
                    );
                    return;
                }
                metadata.add_kubernetes_context(k8s_context);
            }
            Err(_) => {
                warn!(
                    path = %discovered.path.display(),
                    "Failed to parse log file name, logs will be sent without Kubernetes fields"
                );
            }
        }
    }

    let metadata_bytes = match metadata.encode_json() {
        Ok(bytes) => bytes,
        Err(e) => {
            // Without an envelope the source is not shipped at all.
            error!(
                path = %discovered.path.display(),
                error = %e,
                "Failed to encode metadata while preparing to tail"
            );
            return;
        }
    };

    let stop = CancellationToken::new();
    stop_tokens.insert(discovered.path.clone(), stop.clone());

    if let Err(e) = spawn_file_source(tasks, ctx, &discovered, metadata_bytes, stop) {
        // Per-source fatal; other sources continue.
        error!(
            path = %discovered.path.display(),
            error = %e,
            "Unable to start pipeline for file"
        );
        stop_tokens.remove(&discovered.path);
    }
}

fn spawn_file_source(
    tasks: &mut JoinSet<std::result::Result<(), BoxError>>,
    ctx: &PipelineContext,
    discovered: &DiscoveredFile,
    metadata: Vec<u8>,
    stop: CancellationToken,
) -> Result<()> {
    info!(path = %discovered.path.display(), "Starting forward for file");

    let mut tailer = FileTailer::spawn(
        discovered.path.clone(),
        ctx.tail.clone(),
        ctx.store.clone(),
        ctx.quit.clone(),
        stop,
    )?;
    let lines = source_lines(&mut tailer);

    let (batch_tx, batch_rx) = bounded::<Batch>(BATCH_CHANNEL_CAPACITY);
    let period = ctx.batch_period;
    tasks.spawn(async move {
        batch::run(lines, batch_tx, period).await;
        Ok(())
    });

    let config =
        ForwarderConfig::new(ctx.endpoint.clone(), discovered.api_key.clone()).with_metadata(metadata);
    let forwarder = Forwarder::new(ctx.client.clone(), config, ctx.store.clone());
    let quit = ctx.quit.clone();
    tasks.spawn(async move { forwarder.run(batch_rx, quit).await });

    Ok(())
}

/// Ship stdin until EOF or shutdown.
pub async fn run_stdin(ctx: PipelineContext, api_key: String) -> std::result::Result<(), BoxError> {
    info!("Starting forward for STDIN");

    let metadata = ctx
        .base_metadata
        .encode_json()
        .map_err(|e| -> BoxError { format!("failed to encode metadata: {}", e).into() })?;

    let mut tailer = ReaderTailer::spawn(tokio::io::stdin(), ctx.quit.clone());
    let lines = source_lines(&mut tailer);

    let mut tasks: JoinSet<std::result::Result<(), BoxError>> = JoinSet::new();

    let (batch_tx, batch_rx) = bounded::<Batch>(BATCH_CHANNEL_CAPACITY);
    let period = ctx.batch_period;
    tasks.spawn(async move {
        batch::run(lines, batch_tx, period).await;
        Ok(())
    });

    let config = ForwarderConfig::new(ctx.endpoint.clone(), api_key).with_metadata(metadata);
    let forwarder = Forwarder::new(ctx.client.clone(), config, ctx.store.clone());
    let quit = ctx.quit.clone();
    tasks.spawn(async move { forwarder.run(batch_rx, quit).await });

    let mut result = Ok(());
    while let Some(task) = tasks.join_next().await {
        match task {
            Ok(Ok(())) => {}
            Ok(Err(e)) => result = Err(e),
            Err(e) => result = Err(e.into()),
        }
    }
    result
}

async fn wait_for_tasks_with_deadline(
    tasks: &mut JoinSet<std::result::Result<(), BoxError>>,
    deadline: Instant,
) -> std::result::Result<(), BoxError> {
    loop {
        match timeout_at(deadline, tasks.join_next()).await {
            Err(_) => return Err("timed out waiting for tasks to complete".into()),
            Ok(None) => return Ok(()),
            Ok(Some(result)) => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Pipeline task failed during drain"),
                Err(e) => error!(error = %e, "Pipeline task panicked during drain"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::build_client;
    use crate::tail::follower::WatchMode;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use std::fs;
    use tempfile::TempDir;

    fn init_crypto() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    fn test_context(server: &MockServer, quit: CancellationToken) -> PipelineContext {
        PipelineContext {
            store: Arc::new(StateStore::in_memory()),
            client: build_client().unwrap(),
            base_metadata: LogEvent::new(),
            endpoint: server.url("/frames"),
            batch_period: Duration::from_millis(50),
            tail: TailConfig {
                read_from_start_if_new: true,
                mode: WatchMode::Poll,
                poll_interval: Duration::from_millis(10),
            },
            quit,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn discovered_file_is_shipped_end_to_end() {
        init_crypto();
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/frames").body("hello pipeline\n");
            then.status(200);
        });

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.log"), "hello pipeline\n").unwrap();

        let quit = CancellationToken::new();
        let ctx = test_context(&server, quit.clone());
        let store = ctx.store.clone();

        let sources = vec![FileSourceConfig {
            path: format!("{}/*.log", dir.path().display()),
            api_key: "key".to_string(),
        }];

        let run = tokio::spawn(run_file_sources(ctx, sources, SourceFlavor::Plain));

        for _ in 0..500 {
            if mock.hits() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        mock.assert_hits(1);

        // Offset committed for the delivered batch.
        let filename = dir.path().join("app.log").to_string_lossy().to_string();
        assert_eq!(store.get(&filename).unwrap().offset, 15);

        quit.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn excluded_kubernetes_file_is_never_shipped() {
        init_crypto();
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/frames");
            then.status(200);
        });

        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("debug-pod_dev_app.log"),
            "should not ship\n",
        )
        .unwrap();

        let quit = CancellationToken::new();
        let ctx = test_context(&server, quit.clone());

        let sources = vec![FileSourceConfig {
            path: format!("{}/*.log", dir.path().display()),
            api_key: "key".to_string(),
        }];
        let rules = ExcludeRules::new(Some("dev"), None, None).unwrap();

        let run = tokio::spawn(run_file_sources(
            ctx,
            sources,
            SourceFlavor::Kubernetes(rules),
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mock.hits(), 0);

        quit.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
