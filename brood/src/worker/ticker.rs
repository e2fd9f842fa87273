//! The `ticker` worker: logs whatever the parent sends and reports a counter
//! on a fixed interval.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::port::WorkerPort;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub counter: u64,
}

/// Tick until the parent closes the channel.
pub async fn run<R, W>(port: WorkerPort<R, W>, every: Duration) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = port.into_split();

    let mut listener = tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(msg)) => info!(message = %msg, "message from parent"),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "parent channel failed");
                    break;
                }
            }
        }
    });

    // First tick after one full interval.
    let mut ticks = interval_at(Instant::now() + every, every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut counter = 0u64;

    loop {
        tokio::select! {
            _ = &mut listener => break,
            _ = ticks.tick() => {
                writer.send(&Tick { counter }).await?;
                counter += 1;
            }
        }
    }

    Ok(())
}
