//! Byte-forwarding links between processes.
//!
//! A link reads from an upstream source and writes to a downstream child's
//! stdin until the source reaches EOF, then closes that stdin, the same way
//! a shell pipe does.
//!
//! The reading and writing halves are joined by a bounded channel. When the
//! consumer falls behind the channel fills and the reader stops pulling from
//! the producer, which then blocks on its own full OS pipe.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::runner::ProcessHandle;
use super::stdin::StdinWriter;

/// A forwarding relationship. Owns no process.
#[derive(Debug)]
pub struct PipeLink {
    task: Option<JoinHandle<u64>>,
}

impl PipeLink {
    /// Forward `upstream`'s stdout into `downstream`'s stdin.
    ///
    /// Does nothing if `upstream` no longer owns its stdout (not piped,
    /// already observed or linked) or `downstream` has no stdin. In that case
    /// upstream's stdout is left untouched.
    pub fn connect(upstream: &mut ProcessHandle, downstream: &ProcessHandle) -> Self {
        let Some(stdin) = downstream.stdin_writer() else {
            debug!(
                downstream = downstream.id(),
                "downstream has no stdin; link not created"
            );
            return Self::inactive();
        };
        let Some(stdout) = upstream.take_stdout() else {
            debug!(
                upstream = upstream.id(),
                "upstream stdout unavailable; link not created"
            );
            return Self::inactive();
        };

        debug!(
            upstream = upstream.id(),
            downstream = downstream.id(),
            "linking stdout to stdin"
        );
        Self::spawn(
            stdout,
            stdin,
            upstream.chunk_size(),
            upstream.link_buffer(),
        )
    }

    /// Forward any byte source into `downstream`'s stdin, e.g. the
    /// orchestrator's own stdin.
    pub fn from_reader<R>(reader: R, downstream: &ProcessHandle) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        downstream.stdin_writer().map_or_else(Self::inactive, |stdin| {
            Self::spawn(
                reader,
                stdin,
                downstream.chunk_size(),
                downstream.link_buffer(),
            )
        })
    }

    const fn inactive() -> Self {
        Self { task: None }
    }

    fn spawn<R>(mut reader: R, stdin: StdinWriter, chunk_size: usize, buffer: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(buffer);

        tokio::spawn(async move {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            trace!("link writer gone; dropping upstream");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "link read failed");
                        break;
                    }
                }
            }
        });

        let task = tokio::spawn(async move {
            let mut forwarded = 0u64;
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = stdin.write(&chunk).await {
                    debug!(error = %e, "downstream closed; stopping link");
                    break;
                }
                forwarded += chunk.len() as u64;
            }
            stdin.close().await;
            trace!(forwarded, "link finished");
            forwarded
        });

        Self { task: Some(task) }
    }

    pub const fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Wait for the link to finish. Returns the number of bytes forwarded.
    pub async fn finished(self) -> u64 {
        match self.task {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }
}

/// Link each adjacent pair: `handles[0] | handles[1] | ...`.
pub fn chain(handles: &mut [ProcessHandle]) -> Vec<PipeLink> {
    let mut links = Vec::with_capacity(handles.len().saturating_sub(1));
    for i in 1..handles.len() {
        let (left, right) = handles.split_at_mut(i);
        links.push(PipeLink::connect(&mut left[i - 1], &right[0]));
    }
    links
}
