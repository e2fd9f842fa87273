//! Parent side of the worker message channel.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ProcessError, Result};
use crate::process::{
    ExitResult, HandleId, ProcessHandle, ProcessRunner, ProcessSpec, StderrRelay, StdinWriter,
    StreamKind,
};

/// Messages buffered from a worker before its stdout reader pauses.
const MESSAGE_BUFFER: usize = 64;

/// A managed child that exchanges JSON messages with its parent.
///
/// Each message is one line of JSON: the worker reads them from stdin and
/// answers on stdout. Its stderr is relayed to ours. Dropping the worker
/// closes its stdin, which is the worker's signal to exit.
///
/// A request that times out leaves its reply unaccounted for, so the worker
/// is considered gone from then on: later sends and requests fail with
/// [`ProcessError::WorkerGone`].
#[derive(Debug)]
pub struct Worker {
    handle: ProcessHandle,
    stdin: StdinWriter,
    messages: mpsc::Receiver<Value>,
    abandoned: bool,
}

impl Worker {
    /// Launch `spec` as a worker. Stream mode is forced to piped.
    pub fn fork(runner: &ProcessRunner, spec: &ProcessSpec) -> Result<Self> {
        let spec = spec.clone().piped();
        let mut handle = runner.spawn(&spec)?;

        let stdout = handle.take_stdout().ok_or(ProcessError::StreamClosed {
            stream: StreamKind::Stdout,
        })?;
        let stdin = handle.stdin_writer().ok_or(ProcessError::StreamClosed {
            stream: StreamKind::Stdin,
        })?;
        handle.observe(StderrRelay)?;

        let (tx, messages) = mpsc::channel(MESSAGE_BUFFER);
        tokio::spawn(read_messages(stdout, tx, handle.id()));

        debug!(id = handle.id(), pid = ?handle.pid(), "forked worker");

        Ok(Self {
            handle,
            stdin,
            messages,
            abandoned: false,
        })
    }

    pub const fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Send one message.
    pub async fn send<T: Serialize + ?Sized>(&self, msg: &T) -> Result<()> {
        if self.abandoned {
            return Err(ProcessError::WorkerGone);
        }
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.handle.write(&line).await
    }

    /// Next message, or `None` once the worker's stdout is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.messages.recv().await
    }

    /// Next message, deserialized.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Result<T> {
        let value = self.recv().await.ok_or(ProcessError::WorkerGone)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send `msg` and wait for exactly one reply.
    ///
    /// With `timeout = None` this waits as long as the worker stays alive.
    pub async fn request<T, R>(&mut self, msg: &T, timeout: Option<Duration>) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send(msg).await?;
        let Some(limit) = timeout else {
            return self.recv_as().await;
        };
        let reply = tokio::time::timeout(limit, self.recv_as()).await;
        reply.unwrap_or_else(|_| {
            warn!(id = self.handle.id(), ?limit, "worker request timed out");
            self.abandoned = true;
            Err(ProcessError::WorkerTimeout(limit))
        })
    }

    /// Kill the worker outright.
    pub fn terminate(&self) -> Result<()> {
        #[cfg(unix)]
        {
            self.handle.terminate(nix::sys::signal::Signal::SIGKILL)
        }
        #[cfg(not(unix))]
        {
            let _ = self.stdin.close_now();
            Ok(())
        }
    }

    /// Close the worker's stdin and wait for it to exit.
    pub async fn shutdown(self) -> ExitResult {
        self.stdin.close().await;
        self.handle.wait().await
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.stdin.close_now();
    }
}

async fn read_messages(stdout: ChildStdout, tx: mpsc::Sender<Value>, id: HandleId) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => {
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(id, error = %e, line = %line, "skipping malformed worker message");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(id, error = %e, "worker channel read failed");
                break;
            }
        }
    }
    debug!(id, "worker channel closed");
}
