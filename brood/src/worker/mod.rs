//! Fork-style workers: managed children that talk to their parent in JSON
//! messages instead of raw bytes.
//!
//! The parent holds a [`Worker`]; the child uses a [`WorkerPort`]. The
//! built-in workers run as `brood worker <kind>`, so an orchestrator can fork
//! its own executable.

mod channel;
pub mod compute;
mod port;
pub mod ticker;

use clap::ValueEnum;

use crate::process::ProcessSpec;

pub use channel::Worker;
pub use port::{MessageReader, MessageWriter, WorkerPort};

/// Built-in worker programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerKind {
    /// Sum integers and reply once per request.
    Compute,
    /// Emit a counter on an interval.
    Ticker,
}

impl WorkerKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Ticker => "ticker",
        }
    }

    /// Spec that runs this worker from the current executable, as
    /// `<exe> worker <kind>`.
    pub fn current_exe_spec(self) -> std::io::Result<ProcessSpec> {
        let exe = std::env::current_exe()?;
        Ok(ProcessSpec::new(exe.to_string_lossy())
            .args(["worker", self.as_str()])
            .piped())
    }
}
