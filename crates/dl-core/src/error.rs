//! Typed error definitions for the pipeline.
//!
//! Provides [`PipelineError`] for the failure classes callers need to match on
//! (authentication halts, supervision failures). Everything else travels as
//! `anyhow::Error` with context attached at the seam.

use thiserror::Error;

/// Domain-specific errors for the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Feed WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// A record failed the canonical record invariants.
    #[error("invalid record: {0}")]
    Record(String),

    /// A downstream endpoint rejected our credentials. Fatal.
    #[error("{endpoint} rejected credentials (HTTP {status})")]
    Unauthorized { endpoint: String, status: u16 },

    /// A supervised child process exited or the pipe between them broke.
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// File or pipe I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether this error must stop the whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Supervisor(_) | Self::Config(_))
    }
}
