//! Brood - spawn child processes, link their streams and fork workers.
//!
//! Architecture:
//! - The library (`brood`) owns process launching, pipe links, the worker
//!   message channel and the demo HTTP server
//! - This binary is a thin CLI over it, and doubles as the worker executable
//!   (`brood worker <kind>`) so commands can fork themselves

mod cli;

use anyhow::{Context, Result};
use clap::Parser;

use brood::logging::init_logging;
use cli::{execute, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let result = runtime.block_on(execute(cli));

    // Blocking reads of our own stdin cannot be cancelled; don't wait on them.
    runtime.shutdown_background();
    result
}
