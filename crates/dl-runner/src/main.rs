//! # dl-runner
//!
//! Entry point for the live anomaly-detection pipeline.
//!
//! Three modes:
//!
//! - `stream`: feed → normalize → batch → detection endpoint, in one process
//! - `bridge`: feed → normalize → one JSON record per stdout line
//! - `soak`: supervise `bridge | detector`, tee detector output to a log
//!   and forward anomalies to the notification endpoint
//!
//! # Usage
//!
//! ```bash
//! dl-runner stream config.json --log-level info
//! dl-runner bridge | driftlock scan --stdin --format ndjson --output ndjson
//! dl-runner soak soak.json --log-dir logs
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dl_core::config::{AppConfig, load_config};
use dl_core::logging::{LogFormat, LogOptions, init_logging};
use dl_core::ws::FeedConnConfig;
use dl_feed::BatchPolicy;
use dl_forward::{DetectionParams, Forwarder, HttpEndpoint, Notifier, RetryPolicy};
use dl_pipeline::{AnomalyQueue, BridgeOptions, StreamPipeline, Supervisor, run_bridge, spawn_notifier_worker};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Live feed → anomaly detection pipeline runner.
#[derive(Parser)]
#[command(name = "dl-runner", about = "Live feed to anomaly detection pipeline")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Console log format (text, json).
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Optional log directory for file output.
    #[arg(long, global = true)]
    log_dir: Option<String>,
}

#[derive(Subcommand)]
enum Mode {
    /// Stream trades to the detection endpoint.
    Stream {
        /// Configuration file path (JSON).
        config: PathBuf,
    },
    /// Write normalized records to stdout, one JSON object per line.
    Bridge {
        /// Configuration file path (JSON); defaults plus environment if omitted.
        config: Option<PathBuf>,
    },
    /// Run the bridge and a detector as supervised children.
    Soak {
        /// Configuration file path (JSON).
        config: PathBuf,
    },
}

impl Mode {
    fn config_path(&self) -> Option<&Path> {
        match self {
            Mode::Stream { config } | Mode::Soak { config } => Some(config.as_path()),
            Mode::Bridge { config } => config.as_deref(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Mode::Stream { .. } => "stream",
            Mode::Bridge { .. } => "bridge",
            Mode::Soak { .. } => "soak",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = load(cli.mode.config_path())?;

    // 2. Initialize logging (stderr; stdout is data in bridge mode)
    let module_name = config.module_name(&format!("dl-{}", cli.mode.name()));
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    init_logging(&LogOptions {
        level: &cli.log_level,
        dir: log_dir.as_deref(),
        module_name: &module_name,
        format: cli.log_format,
    })?;
    info!("dl-runner starting: mode={} log_level={}", cli.mode.name(), cli.log_level);
    info!(
        "config loaded: source={} feed={} streams={} batch={}/{}ms",
        config.feed.source,
        config.feed.effective_url(),
        config.feed.effective_streams().len(),
        config.batch.max_events,
        config.batch.interval_ms
    );

    // 3. Run the selected mode until a stop signal or a fatal error
    let shutdown = shutdown_signal();
    let result = match cli.mode {
        Mode::Stream { .. } => run_stream(config, shutdown).await,
        Mode::Bridge { .. } => run_bridge_mode(config, shutdown).await,
        Mode::Soak { .. } => run_soak(config, shutdown).await,
    };

    match &result {
        Ok(()) => info!("dl-runner stopped: goodbye"),
        Err(e) => error!("dl-runner failed: {e:#}"),
    }
    result
}

fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(p) => load_config(p)?,
        None => AppConfig::default(),
    };
    config.detection.get_or_insert_with(Default::default);
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn run_stream(config: AppConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let detection = config.detection.clone().unwrap_or_default();
    if detection.api_key.is_none() {
        warn!("no API key configured (set DRIFTLOCK_API_KEY); the endpoint will likely reject requests");
    }

    let url = detection.detect_url();
    let endpoint = HttpEndpoint::new("detect", &url, detection.api_key.clone(), detection.timeout())?;
    let params = DetectionParams::from_config(&detection);
    info!(
        "detect endpoint {url}: window={} baseline={} ncd={:?} p={:?}",
        params.window_size, params.baseline_lines, params.ncd_threshold, params.p_value_threshold
    );

    let forwarder = Forwarder::new(endpoint, params, RetryPolicy::from(&detection.retry));
    let feed = FeedConnConfig::from_feed(&config.feed, config.feed.source.as_str());
    let policy = BatchPolicy::new(config.batch.max_events, config.batch.interval());
    let pipeline =
        StreamPipeline::new(feed, policy, forwarder).with_progress_every(config.feed.effective_progress_every());

    let summary = pipeline.run(shutdown).await?;
    let rate = summary.forward.anomaly_rate().unwrap_or(0.0);
    info!(
        "total events: {} | anomalies: {} | anomaly rate: {rate:.2}%",
        summary.forward.events, summary.forward.anomalies
    );
    Ok(())
}

async fn run_bridge_mode(config: AppConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let feed = FeedConnConfig::from_feed(&config.feed, config.feed.source.as_str());
    let opts = BridgeOptions {
        progress_every: config.feed.effective_progress_every(),
        synthetic_every: config.feed.effective_synthetic_every(),
    };
    let counts = run_bridge(feed, tokio::io::stdout(), shutdown, opts).await?;
    info!("bridge emitted {} records ({} synthetic)", counts.emitted, counts.synthetic);
    Ok(())
}

async fn run_soak(config: AppConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let soak = config.soak.clone().context("config has no `soak` section")?;
    let mut supervisor = Supervisor::spawn(&soak).await?;

    match &config.notification {
        Some(n) => {
            let (queue, rx) = AnomalyQueue::bounded(n.queue_capacity);
            let endpoint = HttpEndpoint::new("notify", &n.url, None, n.timeout())?;
            let notifier =
                Notifier::new(endpoint, n.effective_query(), RetryPolicy::from(&n.retry), n.response_log.clone());
            let policy = BatchPolicy::new(n.batch_size, n.batch_interval());
            let worker = spawn_notifier_worker(rx, notifier, policy, n.poll_timeout());
            supervisor = supervisor.with_notifications(queue, worker);
            info!("notifications → {} (batch {} / {}s)", n.url, n.batch_size, n.batch_timeout_sec);
        }
        None => info!("no `notification` section; anomalies are logged only"),
    }

    let summary = supervisor.run(shutdown).await?;
    info!("soak summary: {summary}");
    Ok(())
}

/// A watch flag that turns true on Ctrl+C (or SIGTERM on unix).
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            error!("cannot listen for Ctrl+C: {e}");
                            term.recv().await;
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}
