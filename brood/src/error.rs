//! Library error type.
//!
//! Library code returns [`ProcessError`]; the CLI and server startup wrap it in
//! `anyhow` with context.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::process::StreamKind;

/// Everything that can go wrong while launching or talking to a child.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The program could not be found or executed, or the OS refused to
    /// create the process.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid process spec: {0}")]
    InvalidSpec(String),

    /// Write after the process ended, after `close_stdin`, or to a stream
    /// that was never piped.
    #[error("{stream} stream is closed")]
    StreamClosed { stream: StreamKind },

    #[error("an observer is already attached to this process")]
    AlreadyObserved,

    #[error("process {pid} is no longer running")]
    NotRunning { pid: u32 },

    /// A worker did not reply within the configured bound.
    #[error("worker did not reply within {0:?}")]
    WorkerTimeout(Duration),

    #[error("worker closed its channel before replying")]
    WorkerGone,

    #[error("malformed worker message: {0}")]
    Message(#[from] serde_json::Error),

    #[cfg(unix)]
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification of a [`ProcessError`], for observers that forward
/// errors over channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Spawn,
    InvalidSpec,
    StreamClosed,
    WorkerTimeout,
    Worker,
    Other,
}

impl ProcessError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Self::StreamClosed { .. } => ErrorKind::StreamClosed,
            Self::WorkerTimeout(_) => ErrorKind::WorkerTimeout,
            Self::WorkerGone | Self::Message(_) => ErrorKind::Worker,
            _ => ErrorKind::Other,
        }
    }

    /// Whether this is a spawn failure.
    pub const fn is_spawn(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;
