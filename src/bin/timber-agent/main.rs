// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use timber_agent::config::{AgentConfig, FileSourceConfig, DEFAULT_CONFIG_PATH};
use timber_agent::forward::build_client;
use timber_agent::kubernetes::{self, ExcludeRules};
use timber_agent::metadata::build_base_metadata;
use timber_agent::pid_file::{remove_pid_file, write_pid_file};
use timber_agent::pipeline::{self, PipelineContext, SourceFlavor};
use timber_agent::shutdown;
use timber_agent::state::{default_statefile_path, StateStore};
use timber_agent::tail::file::{TailConfig, DEFAULT_POLL_INTERVAL};
use timber_agent::tail::follower::WatchMode;

/// Exit code for configuration and statefile errors surfaced at startup.
const EX_DATAERR: u8 = 65;

#[derive(Debug, Parser)]
#[command(name = "timber-agent")]
#[command(bin_name = "timber-agent")]
#[command(version, about = "Forwards logs to timber.io", long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    /// Log filter for the agent's own output
    #[arg(
        long,
        global = true,
        env = "TIMBER_AGENT_LOG_LEVEL",
        default_value = "info"
    )]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Forward newline-delimited logs read from stdin
    CaptureStdin(CaptureStdin),

    /// Forward the log files declared in the configuration file
    CaptureFiles(CaptureFiles),

    /// Forward Kubernetes container logs from this node
    CaptureKube(CaptureKube),
}

#[derive(Debug, Args)]
struct CommonOpts {
    /// Location of the config file to read
    #[arg(long = "config", value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Write the agent's own log to this file instead of stdout
    #[arg(long = "output-log-file", value_name = "FILE")]
    output_log_file: Option<PathBuf>,

    /// Write the agent's process ID to this file
    #[arg(long = "pidfile", value_name = "FILE")]
    pidfile: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CaptureStdin {
    #[command(flatten)]
    common: CommonOpts,

    /// Your timber API key
    #[arg(long = "api-key", env = "TIMBER_API_KEY")]
    api_key: Option<String>,
}

#[derive(Debug, Args)]
struct DaemonOpts {
    /// Run in the background (Linux only)
    #[arg(long = "daemonize")]
    daemonize: bool,

    /// Location of the global statefile
    #[arg(long = "statefile", value_name = "FILE")]
    statefile: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CaptureFiles {
    #[command(flatten)]
    common: CommonOpts,

    #[command(flatten)]
    daemon: DaemonOpts,
}

#[derive(Debug, Args)]
struct CaptureKube {
    #[command(flatten)]
    common: CommonOpts,

    #[command(flatten)]
    daemon: DaemonOpts,
}

enum Capture {
    Stdin { api_key: Option<String> },
    Files { statefile: Option<PathBuf> },
    Kube { statefile: Option<PathBuf> },
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    let (common, capture, daemonize_requested) = match opt.command {
        Commands::CaptureStdin(cmd) => (
            cmd.common,
            Capture::Stdin {
                api_key: cmd.api_key,
            },
            false,
        ),
        Commands::CaptureFiles(cmd) => (
            cmd.common,
            Capture::Files {
                statefile: cmd.daemon.statefile,
            },
            cmd.daemon.daemonize,
        ),
        Commands::CaptureKube(cmd) => (
            cmd.common,
            Capture::Kube {
                statefile: cmd.daemon.statefile,
            },
            cmd.daemon.daemonize,
        ),
    };

    // Daemonize before the runtime exists and before logging is set up, so
    // the forked child owns both.
    let mut pid_written_by_daemon = false;
    if daemonize_requested {
        match daemonize(common.pidfile.as_deref(), common.output_log_file.as_deref()) {
            Ok(()) => pid_written_by_daemon = common.pidfile.is_some(),
            Err(e) => {
                eprintln!("ERROR: {}", e);
                return ExitCode::from(1);
            }
        }
    }

    let _logger = match setup_logging(&opt.log_level, common.output_log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: could not open output log file: {}", e);
            return ExitCode::from(1);
        }
    };

    run_agent(capture, common, pid_written_by_daemon)
}

#[tokio::main]
async fn run_agent(capture: Capture, common: CommonOpts, pid_written_by_daemon: bool) -> ExitCode {
    info!(version = %timber_agent::version(), "Starting timber-agent");

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        error!("Failed to initialize crypto library: {:?}", e);
        return ExitCode::from(1);
    }

    let config_required = matches!(capture, Capture::Files { .. });
    let config = match AgentConfig::load(&common.config, config_required) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Unable to load configuration");
            return ExitCode::from(EX_DATAERR);
        }
    };

    let client = match build_client() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Unable to build HTTP client");
            return ExitCode::from(1);
        }
    };

    let quit = shutdown::handle_signals();

    let write_pid = common.pidfile.as_ref().filter(|_| !pid_written_by_daemon);
    if let Some(pidfile) = write_pid {
        if write_pid_file(pidfile).is_err() {
            return ExitCode::from(1);
        }
    }

    let base_metadata =
        build_base_metadata(config.hostname.as_deref(), config.disable_ec2_metadata).await;

    let result = match capture {
        Capture::Stdin { api_key } => {
            let api_key = api_key.or_else(|| config.default_api_key.clone());
            let Some(api_key) = api_key else {
                error!("No API key: pass --api-key, set TIMBER_API_KEY, or set default_api_key");
                return ExitCode::from(EX_DATAERR);
            };

            let ctx = PipelineContext {
                store: Arc::new(StateStore::in_memory()),
                client,
                base_metadata,
                endpoint: config.endpoint.clone(),
                batch_period: config.batch_period,
                tail: tail_config(&config),
                quit: quit.clone(),
            };
            pipeline::run_stdin(ctx, api_key).await.map_err(Exit::Runtime)
        }

        Capture::Files { statefile } => {
            if config.files.is_empty() {
                error!("No [[files]] entries in configuration");
                return ExitCode::from(EX_DATAERR);
            }
            run_files(
                &config,
                client,
                base_metadata,
                statefile,
                quit.clone(),
                config.files.clone(),
                SourceFlavor::Plain,
            )
            .await
        }

        Capture::Kube { statefile } => {
            let Some(api_key) = config.default_api_key.clone() else {
                error!("capture-kube requires default_api_key in the configuration");
                return ExitCode::from(EX_DATAERR);
            };

            let rules = match ExcludeRules::new(
                config.kubernetes_exclude.namespaces.as_deref(),
                config.kubernetes_exclude.deployments.as_deref(),
                config.kubernetes_exclude.pods.as_deref(),
            ) {
                Ok(rules) => rules,
                Err(e) => {
                    error!(error = %e, "Invalid Kubernetes exclusion rules");
                    return ExitCode::from(EX_DATAERR);
                }
            };

            let sources = vec![FileSourceConfig {
                path: kubernetes::DEFAULT_LOG_GLOB.to_string(),
                api_key,
            }];
            run_files(
                &config,
                client,
                base_metadata,
                statefile,
                quit.clone(),
                sources,
                SourceFlavor::Kubernetes(rules),
            )
            .await
        }
    };

    if let Some(pidfile) = &common.pidfile {
        let _ = remove_pid_file(pidfile);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Exit::Startup) => ExitCode::from(EX_DATAERR),
        Err(Exit::Runtime(e)) => {
            error!(error = %e, "Agent exited with error");
            ExitCode::from(1)
        }
    }
}

enum Exit {
    /// Configuration/statefile error during startup; exit 65.
    Startup,
    Runtime(BoxError),
}

#[allow(clippy::too_many_arguments)]
async fn run_files(
    config: &AgentConfig,
    client: timber_agent::forward::HttpsClient,
    base_metadata: timber_agent::metadata::LogEvent,
    statefile: Option<PathBuf>,
    quit: CancellationToken,
    sources: Vec<FileSourceConfig>,
    flavor: SourceFlavor,
) -> Result<(), Exit> {
    let statefile =
        statefile.unwrap_or_else(|| PathBuf::from(default_statefile_path()));

    let store = match StateStore::open(&statefile) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(statefile = %statefile.display(), error = %e, "Unable to open statefile");
            return Err(Exit::Startup);
        }
    };

    let mut flush = store.start_flush(quit.clone());

    let ctx = PipelineContext {
        store: store.clone(),
        client,
        base_metadata,
        endpoint: config.endpoint.clone(),
        batch_period: config.batch_period,
        tail: tail_config(config),
        quit,
    };

    let run = pipeline::run_file_sources(ctx, sources, flavor);
    tokio::pin!(run);

    let mut flush_done = false;
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            flush_result = &mut flush, if !flush_done => {
                flush_done = true;
                match flatten(flush_result) {
                    // Graceful: quit fired and the final persist landed
                    // while the pipelines are still draining.
                    Ok(()) => {}
                    // Losing the statefile is fatal.
                    Err(e) => break Err(e),
                }
            }
        }
    };

    if !flush_done {
        if let Err(e) = flatten(flush.await) {
            warn!(error = %e, "Final statefile flush failed");
        }
    }

    result.map_err(Exit::Runtime)
}

fn tail_config(config: &AgentConfig) -> TailConfig {
    TailConfig {
        read_from_start_if_new: config.read_from_start,
        mode: if config.poll {
            WatchMode::Poll
        } else {
            WatchMode::Native
        },
        poll_interval: DEFAULT_POLL_INTERVAL,
    }
}

fn flatten(
    result: Result<Result<(), BoxError>, tokio::task::JoinError>,
) -> Result<(), BoxError> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(e.into()),
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_level: &str, output: Option<&Path>) -> std::io::Result<LoggerGuard> {
    LogTracer::init().expect("Unable to set up log tracer");

    let (writer, guard) = match output {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_level(true)
        .compact();

    let subscriber = Registry::default()
        .with(EnvFilter::new(log_level))
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("Unable to install subscriber");

    Ok(guard)
}

#[cfg(target_os = "linux")]
fn daemonize(pid_file: Option<&Path>, log_file: Option<&Path>) -> Result<(), BoxError> {
    // No tracing in here; logging is not set up until after the fork.
    let mut daemon = daemonize::Daemonize::new().working_directory("/");

    if let Some(pid_file) = pid_file {
        daemon = daemon.pid_file(pid_file);
    }

    if let Some(log_file) = log_file {
        let stdout = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_file)
            .map_err(|e| format!("failed to open log file {}: {}", log_file.display(), e))?;
        let stderr = stdout.try_clone()?;
        daemon = daemon.stdout(stdout).stderr(stderr);
    }

    match daemon.start() {
        Ok(()) => Ok(()),
        Err(e) => {
            if e.to_string().contains("lock pid file") {
                Err("detected an existing running agent; remove the PID file if stale".into())
            } else {
                Err(format!("failed to daemonize: {}", e).into())
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn daemonize(_pid_file: Option<&Path>, _log_file: Option<&Path>) -> Result<(), BoxError> {
    Err("daemonizing the agent is not possible on this platform".into())
}
