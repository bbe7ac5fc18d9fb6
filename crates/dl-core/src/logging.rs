//! Operator logging on top of `tracing`.
//!
//! Everything goes to **stderr**: in bridge mode stdout is the data channel
//! and must carry nothing but records. `RUST_LOG` wins over the configured
//! level. With a log directory, a daily-rotating JSON-lines file is written
//! alongside the console output.

use std::io::IsTerminal;
use std::str::FromStr;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::PipelineError;

/// Console output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored when stderr is a terminal.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?} (expected text or json)")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogOptions<'a> {
    /// Default filter when `RUST_LOG` is unset, e.g. `"info"` or `"dl_forward=debug"`.
    pub level: &'a str,
    /// Directory for rotating log files.
    pub dir: Option<&'a str>,
    /// Log file prefix.
    pub module_name: &'a str,
    pub format: LogFormat,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(opts: &LogOptions<'_>) -> Result<(), PipelineError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.level));

    let (text, json) = match opts.format {
        LogFormat::Text => (
            Some(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(std::io::stderr().is_terminal())
                    .with_target(true)
                    .with_thread_ids(true),
            ),
            None,
        ),
        LogFormat::Json => (None, Some(fmt::layer().json().with_writer(std::io::stderr).with_target(true))),
    };

    let file = opts.dir.map(|dir| {
        fmt::layer()
            .json()
            .with_writer(tracing_appender::rolling::daily(dir, opts.module_name))
            .with_ansi(false)
            .with_thread_ids(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(file)
        .try_init()
        .map_err(|e| PipelineError::Config(format!("logging: {e}")))
}
