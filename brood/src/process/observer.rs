//! Lifecycle observers.

use std::io::Write;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use super::exit::ExitResult;
use super::spawn::StreamKind;
use crate::error::{ErrorKind, ProcessError};

/// Receives a child's lifecycle events.
///
/// Callbacks run on runtime worker tasks and must not block. Chunks of one
/// stream arrive in order; stdout and stderr are not ordered relative to each
/// other. `on_exit` is the last call an observer receives.
pub trait ProcessObserver: Send + Sync + 'static {
    fn on_data(&self, _stream: StreamKind, _bytes: &[u8]) {}

    fn on_exit(&self, _result: &ExitResult) {}

    fn on_error(&self, _err: &ProcessError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProcessObserver for NullObserver {}

/// Copies a child's stderr chunks to the orchestrator's stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrRelay;

impl ProcessObserver for StderrRelay {
    fn on_data(&self, stream: StreamKind, bytes: &[u8]) {
        if stream == StreamKind::Stderr {
            let _ = std::io::stderr().write_all(bytes);
        }
    }

    fn on_error(&self, err: &ProcessError) {
        warn!(error = %err, "relayed process reported an error");
    }
}

/// Owned form of an observer callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Data { stream: StreamKind, bytes: Vec<u8> },
    Exit(ExitResult),
    Error { kind: ErrorKind, message: String },
}

/// Observer that forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProcessEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Like [`ChannelObserver::new`], with the receiver wrapped as a stream.
    pub fn stream() -> (Self, UnboundedReceiverStream<ProcessEvent>) {
        let (observer, rx) = Self::new();
        (observer, UnboundedReceiverStream::new(rx))
    }
}

impl ProcessObserver for ChannelObserver {
    fn on_data(&self, stream: StreamKind, bytes: &[u8]) {
        let _ = self.tx.send(ProcessEvent::Data {
            stream,
            bytes: bytes.to_vec(),
        });
    }

    fn on_exit(&self, result: &ExitResult) {
        let _ = self.tx.send(ProcessEvent::Exit(result.clone()));
    }

    fn on_error(&self, err: &ProcessError) {
        let _ = self.tx.send(ProcessEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}
