//! Child process orchestration: spawn programs, observe their streams and
//! exit, link stdout to stdin, and run JSON message workers.
//!
//! ```no_run
//! use brood::process::{ChannelObserver, ProcessRunner, ProcessSpec};
//!
//! # async fn demo() -> brood::error::Result<()> {
//! let runner = ProcessRunner::default();
//! let (observer, mut events) = ChannelObserver::new();
//! let handle = runner.launch(&ProcessSpec::new("pwd").piped(), observer)?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! println!("{}", handle.wait().await);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod server;
pub mod worker;
