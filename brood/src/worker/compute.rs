//! The `compute` worker: a deliberately slow summation, answered once per
//! request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use super::port::WorkerPort;
use crate::error::Result;

/// Message the parent sends to start a computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub cmd: String,
    /// Exclusive upper bound; the worker's default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upto: Option<u64>,
}

impl ComputeRequest {
    pub fn start(upto: u64) -> Self {
        Self {
            cmd: "start".to_string(),
            upto: Some(upto),
        }
    }
}

/// Sum of `0..upto`, one addition at a time.
pub fn long_computation(upto: u64) -> u64 {
    let mut sum = 0u64;
    for i in 0..upto {
        sum = sum.wrapping_add(i);
    }
    sum
}

/// Bound requested by `msg`. Accepts a bare `"start"` as well as a
/// [`ComputeRequest`].
fn requested_upto(msg: &Value, default_upto: u64) -> u64 {
    msg.get("upto")
        .and_then(Value::as_u64)
        .unwrap_or(default_upto)
}

/// Serve compute requests until the parent closes the channel.
pub async fn run<R, W>(port: &mut WorkerPort<R, W>, default_upto: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = port.recv().await? {
        info!(message = %msg, "message from parent");
        let upto = requested_upto(&msg, default_upto);

        let sum = tokio::task::spawn_blocking(move || long_computation(upto))
            .await
            .map_err(std::io::Error::other)?;
        info!(upto, sum, "long computation done");

        port.send(&sum).await?;
    }
    Ok(())
}
