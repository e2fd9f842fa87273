//! Shared, serialized writer for a child's stdin.

use std::io;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;

use super::spawn::StreamKind;
use crate::error::{ProcessError, Result};

/// Cloneable handle to a child's stdin.
///
/// Writers take an async lock, so concurrent callers are queued rather than
/// interleaved. Once closed, the stream stays closed.
#[derive(Debug, Clone)]
pub struct StdinWriter {
    inner: Arc<Mutex<Option<ChildStdin>>>,
}

impl StdinWriter {
    pub(crate) fn new(stdin: ChildStdin) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(stdin))),
        }
    }

    /// Write all of `bytes` and flush.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(closed());
        };

        match write_flush(stdin, bytes).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                // Reader is gone.
                *guard = None;
                Err(closed())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the stream, delivering EOF to the child.
    pub async fn close(&self) {
        let stdin = self.inner.lock().await.take();
        if let Some(mut stdin) = stdin {
            let _ = stdin.shutdown().await;
        }
    }

    /// Close without waiting. Returns `false` if a write currently holds the
    /// stream.
    pub fn close_now(&self) -> bool {
        self.inner.try_lock().map_or(false, |mut guard| {
            guard.take();
            true
        })
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}

async fn write_flush(stdin: &mut ChildStdin, bytes: &[u8]) -> io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

const fn closed() -> ProcessError {
    ProcessError::StreamClosed {
        stream: StreamKind::Stdin,
    }
}
