//! Child side of the worker message channel.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::warn;

use crate::error::Result;

/// Incoming half: one JSON value per line.
#[derive(Debug)]
pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next message from the parent; `None` once the parent closes the
    /// channel. Blank and malformed lines are skipped.
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => warn!(error = %e, line = %line, "skipping malformed parent message"),
            }
        }
        Ok(None)
    }
}

/// Outgoing half.
#[derive(Debug)]
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// What a worker process uses to talk to its parent.
#[derive(Debug)]
pub struct WorkerPort<R, W> {
    reader: MessageReader<R>,
    writer: MessageWriter<W>,
}

impl WorkerPort<tokio::io::Stdin, tokio::io::Stdout> {
    /// Port over this process's own stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> WorkerPort<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: MessageReader::new(reader),
            writer: MessageWriter::new(writer),
        }
    }

    pub async fn recv(&mut self) -> Result<Option<Value>> {
        self.reader.recv().await
    }

    pub async fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<()> {
        self.writer.send(msg).await
    }

    /// Split so reading and writing can happen in separate tasks.
    pub fn into_split(self) -> (MessageReader<R>, MessageWriter<W>) {
        (self.reader, self.writer)
    }
}
