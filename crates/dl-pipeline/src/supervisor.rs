//! Shape B supervisor.
//!
//! Owns both child processes and the pipe between them:
//!
//! ```text
//! bridge.stdout ──► detector.stdin      (OS pipe, no copy through us)
//! detector.stdout ──► Supervisor ─┬─► append-only log (every line, verbatim)
//!                                 └─► AnomalyQueue (lines whose marker is truthy)
//! ```
//!
//! Detector output is read to EOF by its own task and handed over line by
//! line, so a child exiting never cuts a line in half.
//!
//! States: `Running → ShuttingDown → Stopped`. A stop signal is a clean exit.
//! Either child exiting, or the detector output ending, is fatal for the pair:
//! the sibling is killed and [`PipelineError::Supervisor`] is returned.
//! Children are never respawned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use dl_core::config::{CommandConfig, SoakConfig};
use dl_core::error::PipelineError;
use dl_core::stats::ForwardStats;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::anomaly_queue::AnomalyQueue;

/// How long detector output is still read after a child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Detector lines read ahead of the supervisor.
const LINE_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    ShuttingDown,
    Stopped,
}

/// Whether `line` carries a truthy `field`.
///
/// Truthy: `true`, a non-zero number, a non-empty string, array or object.
pub fn is_anomaly(line: &Value, field: &str) -> bool {
    match line.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Counters of one supervised run.
#[derive(Debug, Clone, Default)]
pub struct SoakSummary {
    pub lines: u64,
    pub anomalies: u64,
    /// Lines that were not JSON objects (still logged).
    pub unparsed: u64,
    pub notify: Option<ForwardStats>,
}

impl fmt::Display for SoakSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lines={} anomalies={} unparsed={}", self.lines, self.anomalies, self.unparsed)?;
        if let Some(n) = &self.notify {
            write!(f, " | notify {n}")?;
        }
        Ok(())
    }
}

/// How the read loop ended.
enum Exit {
    Signal,
    Child(&'static str, std::io::Result<ExitStatus>),
    Eof,
    Failed(PipelineError),
}

/// The notification path attached to a supervisor.
struct NotifyPath {
    queue: AnomalyQueue,
    worker: JoinHandle<ForwardStats>,
}

pub struct Supervisor {
    bridge: Child,
    detector: Child,
    lines: mpsc::Receiver<std::io::Result<String>>,
    reader: JoinHandle<()>,
    log: File,
    log_path: PathBuf,
    anomaly_field: String,
    notify: Option<NotifyPath>,
    state: SupervisorState,
}

impl Supervisor {
    /// Start both children, pipe them together and open the log.
    pub async fn spawn(config: &SoakConfig) -> Result<Self> {
        let mut bridge = command(&config.bridge)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning bridge `{}`", config.bridge.program))?;
        let bridge_out = bridge.stdout.take().context("bridge stdout not captured")?;
        let bridge_out: Stdio = bridge_out.try_into().context("handing bridge stdout to the detector")?;

        let mut detector = command(&config.detector)
            .stdin(bridge_out)
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning detector `{}`", config.detector.program))?;
        let detector_out = detector.stdout.take().context("detector stdout not captured")?;

        let log = open_append(&config.stream_log).await?;

        info!(
            "[soak] running: bridge pid={:?} detector pid={:?} log={}",
            bridge.id(),
            detector.id(),
            config.stream_log.display()
        );
        let (line_tx, lines) = mpsc::channel(LINE_QUEUE);
        let reader = tokio::spawn(read_lines(BufReader::new(detector_out), line_tx));

        Ok(Self {
            bridge,
            detector,
            lines,
            reader,
            log,
            log_path: config.stream_log.clone(),
            anomaly_field: config.anomaly_field.clone(),
            notify: None,
            state: SupervisorState::Running,
        })
    }

    /// Route anomalous lines to `queue`; `worker` is awaited during shutdown
    /// so its pending batch is flushed before the children are killed.
    pub fn with_notifications(mut self, queue: AnomalyQueue, worker: JoinHandle<ForwardStats>) -> Self {
        self.notify = Some(NotifyPath { queue, worker });
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Supervise until a stop signal (Ok) or a child failure (Err).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<SoakSummary, PipelineError> {
        let mut summary = SoakSummary::default();

        let exit = loop {
            let line = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break Exit::Signal,
                read = self.lines.recv() => match read {
                    None => break Exit::Eof,
                    Some(Ok(line)) => line,
                    Some(Err(e)) => break Exit::Failed(PipelineError::Io(e)),
                },
                status = self.bridge.wait() => break Exit::Child("bridge", status),
                status = self.detector.wait() => break Exit::Child("detector", status),
            };
            if let Err(e) = self.handle_line(&line, &mut summary).await {
                break Exit::Failed(e);
            }
        };

        self.state = SupervisorState::ShuttingDown;
        if matches!(exit, Exit::Child(..)) {
            self.drain_output(&mut summary).await;
        }
        let outcome = match exit {
            Exit::Signal => {
                info!("[soak] stop signal received");
                Ok(())
            }
            Exit::Eof => Err(PipelineError::Supervisor("detector output closed".into())),
            Exit::Child(name, Ok(status)) => Err(PipelineError::Supervisor(format!("{name} exited ({status})"))),
            Exit::Child(name, Err(e)) => Err(PipelineError::Supervisor(format!("waiting on {name}: {e}"))),
            Exit::Failed(e) => Err(e),
        };
        if let Err(e) = &outcome {
            error!("[soak] {e}; shutting down the pair");
        }

        // Flush the pending notification batch before the children go.
        if let Some(NotifyPath { queue, worker }) = self.notify.take() {
            drop(queue);
            match worker.await {
                Ok(stats) => summary.notify = Some(stats),
                Err(e) => warn!("[soak] notification worker failed: {e}"),
            }
        }

        terminate("bridge", &mut self.bridge).await;
        terminate("detector", &mut self.detector).await;
        self.reader.abort();
        if let Err(e) = self.log.flush().await {
            warn!("[soak] flushing {}: {e}", self.log_path.display());
        }
        self.state = SupervisorState::Stopped;

        info!("[soak] stopped: {summary}");
        outcome.map(|()| summary)
    }

    /// Read what the detector already wrote, bounded by [`DRAIN_TIMEOUT`].
    async fn drain_output(&mut self, summary: &mut SoakSummary) {
        let drain = async {
            while let Some(Ok(line)) = self.lines.recv().await {
                if self.handle_line(&line, summary).await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("[soak] detector output still open after {DRAIN_TIMEOUT:?}, giving up");
        }
    }

    /// Tee one detector line to the log and queue it if anomalous.
    async fn handle_line(&mut self, line: &str, summary: &mut SoakSummary) -> Result<(), PipelineError> {
        if line.ends_with('\n') {
            self.log.write_all(line.as_bytes()).await?;
        } else {
            let mut terminated = String::with_capacity(line.len() + 1);
            terminated.push_str(line);
            terminated.push('\n');
            self.log.write_all(terminated.as_bytes()).await?;
        }
        self.log.flush().await?;
        summary.lines += 1;

        let text = line.trim();
        if text.is_empty() {
            return Ok(());
        }
        let value: Value = match serde_json::from_str(text) {
            Ok(v @ Value::Object(_)) => v,
            _ => {
                summary.unparsed += 1;
                debug!("[soak] non-JSON detector line ({} bytes)", text.len());
                return Ok(());
            }
        };
        if !is_anomaly(&value, &self.anomaly_field) {
            return Ok(());
        }

        summary.anomalies += 1;
        let score = value.get("anomaly_score").map_or_else(|| "N/A".to_string(), Value::to_string);
        info!("[soak] anomaly #{} queued (anomaly_score={score})", summary.anomalies);
        if let Some(path) = &self.notify {
            path.queue.push(value).await?;
        }
        Ok(())
    }
}

/// Forward detector lines until EOF. A final line without a newline is
/// still delivered.
async fn read_lines(mut out: BufReader<ChildStdout>, tx: mpsc::Sender<std::io::Result<String>>) {
    loop {
        let mut line = String::new();
        let item = match out.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => Ok(line),
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

fn command(cfg: &CommandConfig) -> Command {
    let mut cmd = Command::new(&cfg.program);
    cmd.args(&cfg.args).envs(&cfg.env).stderr(Stdio::inherit()).kill_on_drop(true);
    cmd
}

async fn open_append(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating {}", dir.display()))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening stream log {}", path.display()))
}

/// Kill a child that is still running and reap it.
async fn terminate(name: &str, child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => debug!("[soak] {name} already exited ({status})"),
        _ => {
            if let Err(e) = child.kill().await {
                warn!("[soak] killing {name}: {e}");
            } else {
                debug!("[soak] {name} killed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::anomaly_queue::Pop;

    fn sh(script: &str) -> CommandConfig {
        CommandConfig { program: "sh".into(), args: vec!["-c".into(), script.into()], env: HashMap::new() }
    }

    fn soak(bridge: &str, detector: &str, log: PathBuf) -> SoakConfig {
        SoakConfig { bridge: sh(bridge), detector: sh(detector), stream_log: log, anomaly_field: "anomaly".into() }
    }

    #[test]
    fn truthiness() {
        let f = "anomaly";
        assert!(is_anomaly(&json!({"anomaly": true}), f));
        assert!(is_anomaly(&json!({"anomaly": 1}), f));
        assert!(is_anomaly(&json!({"anomaly": "yes"}), f));
        assert!(is_anomaly(&json!({"anomaly": {"ncd": 0.4}}), f));
        assert!(!is_anomaly(&json!({"anomaly": false}), f));
        assert!(!is_anomaly(&json!({"anomaly": 0}), f));
        assert!(!is_anomaly(&json!({"anomaly": ""}), f));
        assert!(!is_anomaly(&json!({"anomaly": null}), f));
        assert!(!is_anomaly(&json!({"anomaly": []}), f));
        assert!(!is_anomaly(&json!({"other": true}), f));
        assert!(is_anomaly(&json!({"flagged": true}), "flagged"));
    }

    #[tokio::test]
    async fn tees_lines_and_queues_anomalies() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/live.ndjson");
        let bridge = r#"printf '{"id":"1","anomaly":false}\n{"id":"2","anomaly":true,"anomaly_score":0.91}\nplain text\n{"id":"3"}\n'"#;
        let cfg = soak(bridge, "exec cat", log.clone());

        let (queue, rx) = AnomalyQueue::bounded(16);
        let sup = Supervisor::spawn(&cfg).await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Running);
        let collector = tokio::task::spawn_blocking(move || {
            let mut got = Vec::new();
            loop {
                match rx.pop_timeout(Duration::from_millis(20)) {
                    Pop::Item(v) => got.push(v),
                    Pop::Empty => {}
                    Pop::Closed => return got,
                }
            }
        });
        let worker = tokio::spawn(async { ForwardStats::new() });
        let sup = sup.with_notifications(queue, worker);

        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = sup.run(stop_rx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Supervisor(_)));

        let got = collector.await.unwrap();
        assert_eq!(got, vec![json!({"id":"2","anomaly":true,"anomaly_score":0.91})]);

        let text = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            text,
            "{\"id\":\"1\",\"anomaly\":false}\n{\"id\":\"2\",\"anomaly\":true,\"anomaly_score\":0.91}\nplain text\n{\"id\":\"3\"}\n"
        );
    }

    #[tokio::test]
    async fn unterminated_last_line_is_logged_and_queued() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("live.ndjson");
        let bridge = r#"printf '{"id":"a","anomaly":false}\n{"id":"tail","anomaly":true}'; sleep 0.5"#;
        let cfg = soak(bridge, "exec cat", log.clone());

        let (queue, rx) = AnomalyQueue::bounded(16);
        let sup = Supervisor::spawn(&cfg).await.unwrap();
        let worker = tokio::spawn(async { ForwardStats::new() });
        let sup = sup.with_notifications(queue, worker);

        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = tokio::time::timeout(Duration::from_secs(5), sup.run(stop_rx)).await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Supervisor(_)));

        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "{\"id\":\"a\",\"anomaly\":false}\n{\"id\":\"tail\",\"anomaly\":true}\n"
        );
        assert!(matches!(rx.pop_timeout(Duration::from_millis(10)), Pop::Item(v) if v["id"] == "tail"));
        assert!(matches!(rx.pop_timeout(Duration::from_millis(10)), Pop::Closed));
    }

    #[tokio::test]
    async fn log_is_appended_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("live.ndjson");
        std::fs::write(&log, "old\n").unwrap();
        let cfg = soak("echo new", "exec cat", log.clone());

        let sup = Supervisor::spawn(&cfg).await.unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        assert!(sup.run(stop_rx).await.is_err());
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "old\nnew\n");
    }

    #[tokio::test]
    async fn stop_signal_is_clean_and_kills_children() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = soak(
            r#"while true; do echo '{"anomaly":false}'; sleep 0.05; done"#,
            "exec cat",
            dir.path().join("live.ndjson"),
        );
        let sup = Supervisor::spawn(&cfg).await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn(sup.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        stop_tx.send(true).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
        assert!(summary.lines >= 1);
        assert_eq!(summary.anomalies, 0);
    }

    #[tokio::test]
    async fn detector_exit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = soak("exec sleep 30", "exit 3", dir.path().join("live.ndjson"));
        let sup = Supervisor::spawn(&cfg).await.unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = tokio::time::timeout(Duration::from_secs(5), sup.run(stop_rx)).await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Supervisor(_)));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SoakConfig {
            bridge: CommandConfig { program: "/nonexistent/bridge".into(), args: vec![], env: HashMap::new() },
            detector: sh("exec cat"),
            stream_log: dir.path().join("live.ndjson"),
            anomaly_field: "anomaly".into(),
        };
        assert!(Supervisor::spawn(&cfg).await.is_err());
    }
}
